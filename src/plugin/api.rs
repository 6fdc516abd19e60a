//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd Team.
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! You may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//!     http://www.apache.org/licenses/LICENSE-2.0
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

//! Eagle Plugin API - the interface a plugin module implements.
//!
//! A native plugin is a `cdylib` exporting two C symbols, normally generated
//! with [`eagle_declare_plugin!`](crate::eagle_declare_plugin):
//!
//! - `_eagle_plugin_abi_version() -> u32`
//! - `_eagle_plugin_create() -> *mut EgPluginBox`
//!
//! The boxed trait object crosses the boundary as a thin pointer, so host and
//! plugin must be built with the same compiler and the same `eagle` version.
//!
//! # Example
//!
//! ```ignore
//! use eagle::plugin::api::{EgPlugin, EgPluginContext};
//! use eagle::plugin::metadata::EgPluginMetadata;
//!
//! struct Greeter;
//!
//! impl EgPlugin for Greeter {
//!     fn metadata(&self) -> EgPluginMetadata {
//!         EgPluginMetadata::new("greeter", "1.0.0")
//!     }
//!     fn initialize(&mut self, _ctx: &EgPluginContext) -> eagle::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! eagle::eagle_declare_plugin!(Greeter);
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::Result;
use crate::plugin::metadata::EgPluginMetadata;
use crate::service::descriptor::EgServiceDescriptor;
use crate::service::registry::EgServiceRegistry;

pub const EG_PLUGIN_ABI_VERSION: u32 = 1;

pub const EG_PLUGIN_ABI_SYMBOL: &[u8] = b"_eagle_plugin_abi_version";
pub const EG_PLUGIN_CREATE_SYMBOL: &[u8] = b"_eagle_plugin_create";

pub type EgPluginAbiVersionFn = unsafe extern "C" fn() -> u32;
pub type EgPluginCreateFn = unsafe extern "C" fn() -> *mut EgPluginBox;

/// Lifecycle and capability surface of a plugin instance.
///
/// Every method except `metadata` and `initialize` has a no-op default.
pub trait EgPlugin: Send {
    fn metadata(&self) -> EgPluginMetadata;

    fn initialize(&mut self, context: &EgPluginContext) -> Result<()>;

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn configure(&mut self, _config: &Value) -> Result<()> {
        Ok(())
    }

    /// Services to register with the registry after a successful initialize.
    fn services(&self) -> Vec<EgServiceDescriptor> {
        Vec::new()
    }

    fn is_healthy(&self) -> bool {
        true
    }

    /// Opaque state carried across a hot reload.
    fn save_state(&self) -> Option<Value> {
        None
    }

    fn restore_state(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }
}

/// What a plugin receives at initialization.
#[derive(Clone, Debug)]
pub struct EgPluginContext {
    pub plugin_id: String,
    pub config: Value,
    pub registry: Option<Arc<EgServiceRegistry>>,
    pub data_dir: Option<PathBuf>,
}

impl EgPluginContext {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        EgPluginContext {
            plugin_id: plugin_id.into(),
            config: Value::Null,
            registry: None,
            data_dir: None,
        }
    }
}

/// Sized wrapper so the factory can return a thin pointer.
pub struct EgPluginBox(pub Box<dyn EgPlugin>);

impl EgPluginBox {
    pub fn new<P: EgPlugin + 'static>(plugin: P) -> Self {
        EgPluginBox(Box::new(plugin))
    }

    pub fn into_inner(self) -> Box<dyn EgPlugin> {
        self.0
    }
}

/// Export the plugin factory symbols for a `cdylib` plugin.
///
/// `eagle_declare_plugin!(MyPlugin)` uses `MyPlugin::default()`;
/// `eagle_declare_plugin!(MyPlugin, MyPlugin::new(..))` uses the expression.
#[macro_export]
macro_rules! eagle_declare_plugin {
    ($plugin:ty) => {
        $crate::eagle_declare_plugin!($plugin, <$plugin as ::std::default::Default>::default());
    };
    ($plugin:ty, $ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn _eagle_plugin_abi_version() -> u32 {
            $crate::plugin::api::EG_PLUGIN_ABI_VERSION
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn _eagle_plugin_create() -> *mut $crate::plugin::api::EgPluginBox {
            let plugin: $plugin = $ctor;
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(
                $crate::plugin::api::EgPluginBox::new(plugin),
            ))
        }
    };
}
