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

//! # Plugin Module Loading
//!
//! - **EgModuleLoader**: probe a module for metadata, or load it for use
//! - **EgNativeModuleLoader**: shared libraries through `libloading`
//! - **EgStaticModuleLoader**: plugins linked into the host, addressed by
//!   the file stem of a module path
//!
//! A loaded module owns its plugin object and, for native modules, the
//! library it came from. The plugin is always dropped before the library.

use std::collections::HashMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::errors::{panic_message, EgError, Result};
use crate::plugin::api::EgPlugin;
use crate::plugin::metadata::EgPluginMetadata;

/// A plugin instance together with the module that backs it.
pub struct EgLoadedModule {
    // Declaration order is drop order: plugin before library.
    plugin: Box<dyn EgPlugin>,
    #[cfg(feature = "native-plugins")]
    library: Option<libloading::Library>,
    path: PathBuf,
}

impl std::fmt::Debug for EgLoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgLoadedModule")
            .field("path", &self.path)
            .field("native", &self.is_native())
            .finish()
    }
}

impl EgLoadedModule {
    pub fn from_plugin(plugin: Box<dyn EgPlugin>, path: impl Into<PathBuf>) -> Self {
        EgLoadedModule {
            plugin,
            #[cfg(feature = "native-plugins")]
            library: None,
            path: path.into(),
        }
    }

    #[cfg(feature = "native-plugins")]
    fn from_library(plugin: Box<dyn EgPlugin>, library: libloading::Library, path: &Path) -> Self {
        EgLoadedModule {
            plugin,
            library: Some(library),
            path: path.to_path_buf(),
        }
    }

    pub fn plugin(&self) -> &dyn EgPlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn EgPlugin {
        self.plugin.as_mut()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_native(&self) -> bool {
        #[cfg(feature = "native-plugins")]
        {
            self.library.is_some()
        }
        #[cfg(not(feature = "native-plugins"))]
        {
            false
        }
    }

    /// Drop the plugin, then unload the library.
    pub fn release(self) {
        let EgLoadedModule {
            plugin,
            #[cfg(feature = "native-plugins")]
            library,
            path,
        } = self;
        drop(plugin);
        #[cfg(feature = "native-plugins")]
        drop(library);
        log::debug!(
            "plugin.loader.released: module released - path={}",
            path.display()
        );
    }
}

/// Probes and loads plugin modules.
pub trait EgModuleLoader: Send + Sync {
    /// File extension of loadable modules, without the dot.
    fn module_extension(&self) -> &str {
        std::env::consts::DLL_EXTENSION
    }

    /// Read a module's metadata without keeping it loaded.
    fn probe(&self, path: &Path) -> Result<EgPluginMetadata>;

    /// Load a module and instantiate its plugin. The plugin is not yet
    /// initialized.
    fn load(&self, path: &Path) -> Result<EgLoadedModule>;
}

/// Modules with `extension` directly inside each directory, sorted.
/// Missing directories are skipped.
pub fn discover_modules(dirs: &[PathBuf], extension: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!(
                    "plugin.loader.dir_skipped: plugin directory not readable - dir={}, error={}",
                    dir.display(),
                    e
                );
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let matches = path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case(extension))
                    .unwrap_or(false);
            if matches {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

fn _read_metadata(plugin: &dyn EgPlugin, path: &Path) -> Result<EgPluginMetadata> {
    let metadata = catch_unwind(AssertUnwindSafe(|| plugin.metadata())).map_err(|payload| {
        EgError::invocation(
            path.display().to_string(),
            "metadata",
            format!("plugin panicked: {}", panic_message(payload.as_ref())),
        )
    })?;
    metadata.validate()?;
    Ok(metadata)
}

/// Loads `cdylib` plugin modules exporting the Eagle factory symbols.
#[cfg(feature = "native-plugins")]
#[derive(Debug, Default)]
pub struct EgNativeModuleLoader;

#[cfg(feature = "native-plugins")]
impl EgNativeModuleLoader {
    pub fn new() -> Self {
        EgNativeModuleLoader
    }

    fn _open(&self, path: &Path) -> Result<(libloading::Library, Box<dyn EgPlugin>)> {
        use crate::plugin::api::{
            EgPluginAbiVersionFn, EgPluginBox, EgPluginCreateFn, EG_PLUGIN_ABI_SYMBOL,
            EG_PLUGIN_ABI_VERSION, EG_PLUGIN_CREATE_SYMBOL,
        };

        let target = path.display().to_string();
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| EgError::invocation(&target, "load", e.to_string()))?;

        let abi_version = unsafe {
            let symbol = library
                .get::<EgPluginAbiVersionFn>(EG_PLUGIN_ABI_SYMBOL)
                .map_err(|e| EgError::invocation(&target, "abi_version", e.to_string()))?;
            symbol()
        };
        if abi_version != EG_PLUGIN_ABI_VERSION {
            return Err(EgError::validation(format!(
                "module '{}' has ABI version {}, expected {}",
                target, abi_version, EG_PLUGIN_ABI_VERSION
            )));
        }

        let raw: *mut EgPluginBox = unsafe {
            let symbol = library
                .get::<EgPluginCreateFn>(EG_PLUGIN_CREATE_SYMBOL)
                .map_err(|e| EgError::invocation(&target, "create", e.to_string()))?;
            symbol()
        };
        if raw.is_null() {
            return Err(EgError::invocation(&target, "create", "factory returned null"));
        }
        let plugin = unsafe { Box::from_raw(raw) }.into_inner();
        Ok((library, plugin))
    }
}

#[cfg(feature = "native-plugins")]
impl EgModuleLoader for EgNativeModuleLoader {
    fn probe(&self, path: &Path) -> Result<EgPluginMetadata> {
        let (library, plugin) = self._open(path)?;
        let metadata = _read_metadata(plugin.as_ref(), path);
        drop(plugin);
        drop(library);
        metadata
    }

    fn load(&self, path: &Path) -> Result<EgLoadedModule> {
        let (library, plugin) = self._open(path)?;
        log::debug!(
            "plugin.loader.native_loaded: native module loaded - path={}",
            path.display()
        );
        Ok(EgLoadedModule::from_library(plugin, library, path))
    }
}

pub type EgPluginFactory = Arc<dyn Fn() -> Box<dyn EgPlugin> + Send + Sync>;

/// Serves plugins compiled into the host. A module path resolves to the
/// factory registered under its file stem, so discovery still works on
/// placeholder files in the plugin directories.
#[derive(Default)]
pub struct EgStaticModuleLoader {
    factories: RwLock<HashMap<String, EgPluginFactory>>,
}

impl std::fmt::Debug for EgStaticModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stems: Vec<String> = self
            .factories
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        stems.sort();
        f.debug_struct("EgStaticModuleLoader")
            .field("modules", &stems)
            .finish()
    }
}

impl EgStaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, module_stem: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn EgPlugin> + Send + Sync + 'static,
    {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(module_stem.into(), Arc::new(factory));
        }
    }

    pub fn with_module<F>(self, module_stem: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn EgPlugin> + Send + Sync + 'static,
    {
        self.register(module_stem, factory);
        self
    }

    fn _factory(&self, path: &Path) -> Result<EgPluginFactory> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| EgError::validation(format!("invalid module path '{}'", path.display())))?;
        self.factories
            .read()
            .map_err(|_| EgError::internal("static loader lock poisoned"))?
            .get(stem)
            .cloned()
            .ok_or_else(|| EgError::not_found("module", stem))
    }

    fn _instantiate(&self, path: &Path) -> Result<Box<dyn EgPlugin>> {
        let factory = self._factory(path)?;
        catch_unwind(AssertUnwindSafe(|| factory())).map_err(|payload| {
            EgError::invocation(
                path.display().to_string(),
                "create",
                format!("plugin factory panicked: {}", panic_message(payload.as_ref())),
            )
        })
    }
}

impl EgModuleLoader for EgStaticModuleLoader {
    fn probe(&self, path: &Path) -> Result<EgPluginMetadata> {
        let plugin = self._instantiate(path)?;
        _read_metadata(plugin.as_ref(), path)
    }

    fn load(&self, path: &Path) -> Result<EgLoadedModule> {
        let plugin = self._instantiate(path)?;
        Ok(EgLoadedModule::from_plugin(plugin, path))
    }
}
