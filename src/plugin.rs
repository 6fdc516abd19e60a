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

//! # Eagle Plugin Module
//!
//! Plugin lifecycle management:
//!
//! - **api**: the `EgPlugin` trait and the native module ABI
//! - **metadata**: self-description reported by a module
//! - **loader**: module discovery and loading (native or static)
//! - **dependency**: dependency graph, cycle search and load order
//! - **signature**: Ed25519 module signatures with certificates
//! - **state**: state snapshots and their on-disk store
//! - **manager**: scan, load, unload and reload
//! - **hot_reload**: save and restore orchestration around a reload

pub mod api;
pub mod dependency;
pub mod hot_reload;
pub mod loader;
pub mod manager;
pub mod metadata;
pub mod signature;
pub mod state;

pub use api::{EgPlugin, EgPluginBox, EgPluginContext, EG_PLUGIN_ABI_VERSION};
pub use dependency::EgDependencyGraph;
pub use hot_reload::{
    EgBatchReloadResult, EgHotReloadConfig, EgHotReloadManager, EgReloadResult, EgReloadState,
};
#[cfg(feature = "native-plugins")]
pub use loader::EgNativeModuleLoader;
pub use loader::{discover_modules, EgLoadedModule, EgModuleLoader, EgPluginFactory, EgStaticModuleLoader};
pub use manager::{EgExceptionHandler, EgPluginManager, EgPluginManagerConfig};
pub use metadata::{EgPluginCategory, EgPluginMetadata};
pub use signature::{
    legacy_digest, EgPluginCertificate, EgPluginSignature, EgPluginSigner, EgSignaturePolicy,
    EgSignatureScheme, EgSignatureVerifier,
};
pub use state::{EgPluginStateSnapshot, EgStateStore};
