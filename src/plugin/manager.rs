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

//! # Plugin Manager
//!
//! Discovery, loading and unloading of plugin modules.
//!
//! ## Load sequence
//!
//! 1. Already loaded: succeed without side effects
//! 2. Metadata must be known (from a scan or `register_metadata`)
//! 3. Every direct dependency must have metadata
//! 4. No dependency cycle may be reachable from the plugin
//! 5. Dependencies load first, recursively, with the manager lock released
//! 6. The module is located and loaded. With signatures required, the
//!    verified bytes are staged to a private copy and that copy is loaded
//! 7. `initialize` runs inside a panic boundary
//! 8. Exported services are registered with the service registry
//!
//! Plugin code never runs while the manager lock is held. A load of a plugin
//! that another thread is already loading waits for that load to finish.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{panic_message, EgError, Result};
use crate::events::{EgEvent, EgEventBus};
use crate::monitor::{EgAlertSeverity, EgAlertSink, EgLogMonitor, EgPerformanceMonitor};
use crate::plugin::api::{EgPlugin, EgPluginContext};
use crate::plugin::dependency::EgDependencyGraph;
use crate::plugin::loader::{discover_modules, EgLoadedModule, EgModuleLoader};
use crate::plugin::metadata::EgPluginMetadata;
use crate::plugin::signature::{EgSignaturePolicy, EgSignatureVerifier};
use crate::plugin::state::{now_millis, EgPluginStateSnapshot};
use crate::service::descriptor::EgServiceDescriptor;
use crate::service::registry::EgServiceRegistry;

/// `plugins` configuration section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgPluginManagerConfig {
    /// Directories scanned for modules.
    pub paths: Vec<PathBuf>,
    /// Plugins loaded by `EgFramework::start`.
    pub auto_load: Vec<String>,
    pub require_signature: bool,
    #[serde(flatten)]
    pub signature: EgSignaturePolicy,
    /// Snapshot directory for hot reload. Also the parent of per-plugin data
    /// directories.
    pub state_dir: Option<PathBuf>,
}

/// Called with `(plugin_id, stage, message)` when plugin code fails or
/// panics during a lifecycle call.
pub type EgExceptionHandler = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

struct EgActivePlugin {
    module: Arc<Mutex<EgLoadedModule>>,
    /// Descriptors registered on behalf of the plugin.
    services: Vec<EgServiceDescriptor>,
    loaded_at_ms: u64,
}

#[derive(Default)]
struct EgPluginManagerInner {
    paths: Vec<PathBuf>,
    metadata: HashMap<String, EgPluginMetadata>,
    module_paths: HashMap<String, PathBuf>,
    loaded: HashMap<String, EgActivePlugin>,
    loading: HashSet<String>,
    configs: HashMap<String, Value>,
}

/// Clears a plugin's in-progress mark however the load ends and wakes
/// threads waiting on it.
struct EgLoadingGuard<'a> {
    inner: &'a Mutex<EgPluginManagerInner>,
    load_done: &'a Condvar,
    plugin_id: String,
}

impl Drop for EgLoadingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.loading.remove(&self.plugin_id);
        drop(inner);
        self.load_done.notify_all();
    }
}

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct EgPluginManager {
    config: EgPluginManagerConfig,
    loader: Arc<dyn EgModuleLoader>,
    registry: Option<Arc<EgServiceRegistry>>,
    events: Arc<EgEventBus>,
    verifier: EgSignatureVerifier,
    alerts: RwLock<Arc<dyn EgAlertSink>>,
    performance: RwLock<Arc<dyn EgPerformanceMonitor>>,
    exception_handler: RwLock<Option<EgExceptionHandler>>,
    inner: Mutex<EgPluginManagerInner>,
    load_done: Condvar,
}

impl std::fmt::Debug for EgPluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgPluginManager")
            .field("available", &self.available_plugins())
            .field("loaded", &self.loaded_plugins())
            .finish()
    }
}

impl EgPluginManager {
    pub fn new(config: EgPluginManagerConfig, loader: Arc<dyn EgModuleLoader>) -> Self {
        let verifier = EgSignatureVerifier::new(config.signature.clone());
        let inner = EgPluginManagerInner {
            paths: config.paths.clone(),
            ..Default::default()
        };
        let alerts: Arc<dyn EgAlertSink> = Arc::new(EgLogMonitor);
        let performance: Arc<dyn EgPerformanceMonitor> = Arc::new(EgLogMonitor);
        EgPluginManager {
            config,
            loader,
            registry: None,
            events: Arc::new(EgEventBus::new()),
            verifier,
            alerts: RwLock::new(alerts),
            performance: RwLock::new(performance),
            exception_handler: RwLock::new(None),
            inner: Mutex::new(inner),
            load_done: Condvar::new(),
        }
    }

    /// Registry that receives exported services and is handed to plugins.
    pub fn with_registry(mut self, registry: Arc<EgServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EgEventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EgPluginManagerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EgEventBus> {
        &self.events
    }

    pub fn registry(&self) -> Option<&Arc<EgServiceRegistry>> {
        self.registry.as_ref()
    }

    pub fn set_alert_sink(&self, sink: Arc<dyn EgAlertSink>) {
        if let Ok(mut guard) = self.alerts.write() {
            *guard = sink;
        }
    }

    pub fn set_performance_monitor(&self, monitor: Arc<dyn EgPerformanceMonitor>) {
        if let Ok(mut guard) = self.performance.write() {
            *guard = monitor;
        }
    }

    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str, &str) + Send + Sync + 'static,
    {
        let handler: EgExceptionHandler = Arc::new(handler);
        if let Ok(mut guard) = self.exception_handler.write() {
            *guard = Some(handler);
        }
    }

    fn _inner(&self) -> MutexGuard<'_, EgPluginManagerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn plugin_paths(&self) -> Vec<PathBuf> {
        self._inner().paths.clone()
    }

    pub fn add_plugin_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut inner = self._inner();
        if !inner.paths.contains(&path) {
            inner.paths.push(path);
        }
    }

    // ---------------------------------------------------------------------
    // Discovery
    // ---------------------------------------------------------------------

    /// Probe every module in the plugin paths and record its metadata.
    /// Nothing is loaded. Returns the ids found, sorted.
    pub fn scan_plugins(&self) -> Vec<String> {
        let paths = self.plugin_paths();
        let candidates = discover_modules(&paths, self.loader.module_extension());
        let mut found: Vec<(EgPluginMetadata, PathBuf)> = Vec::new();
        for path in candidates {
            match self.loader.probe(&path) {
                Ok(metadata) => {
                    if found.iter().any(|(m, _)| m.plugin_id == metadata.plugin_id) {
                        log::warn!(
                            "plugin.manager.duplicate: duplicate plugin id ignored - plugin={}, path={}",
                            metadata.plugin_id,
                            path.display()
                        );
                        continue;
                    }
                    found.push((metadata, path));
                }
                Err(e) => log::warn!(
                    "plugin.manager.probe_failed: module skipped - path={}, error={}",
                    path.display(),
                    e
                ),
            }
        }

        let mut ids: Vec<String> = found.iter().map(|(m, _)| m.plugin_id.clone()).collect();
        ids.sort();
        {
            let mut inner = self._inner();
            for (metadata, path) in found {
                inner.module_paths.insert(metadata.plugin_id.clone(), path);
                inner.metadata.insert(metadata.plugin_id.clone(), metadata);
            }
        }
        log::info!(
            "plugin.manager.scanned: plugin scan complete - found={}, paths={}",
            ids.len(),
            paths.len()
        );
        ids
    }

    /// Record metadata without a scan, optionally with the module that
    /// provides it.
    pub fn register_metadata(
        &self,
        metadata: EgPluginMetadata,
        module_path: Option<PathBuf>,
    ) -> Result<()> {
        metadata.validate()?;
        let mut inner = self._inner();
        if let Some(path) = module_path {
            inner.module_paths.insert(metadata.plugin_id.clone(), path);
        }
        inner.metadata.insert(metadata.plugin_id.clone(), metadata);
        Ok(())
    }

    pub fn available_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self._inner().metadata.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get_plugin_metadata(&self, plugin_id: &str) -> Option<EgPluginMetadata> {
        self._inner().metadata.get(plugin_id).cloned()
    }

    pub fn is_plugin_loaded(&self, plugin_id: &str) -> bool {
        self._inner().loaded.contains_key(plugin_id)
    }

    pub fn loaded_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self._inner().loaded.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Milliseconds since the epoch at which the plugin finished loading.
    pub fn loaded_at(&self, plugin_id: &str) -> Option<u64> {
        self._inner().loaded.get(plugin_id).map(|a| a.loaded_at_ms)
    }

    /// Keys (`name@version`) of the services the plugin exported.
    pub fn exported_services(&self, plugin_id: &str) -> Vec<String> {
        self._inner()
            .loaded
            .get(plugin_id)
            .map(|a| a.services.iter().map(EgServiceDescriptor::key).collect())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Dependencies
    // ---------------------------------------------------------------------

    fn _graph(&self) -> EgDependencyGraph {
        EgDependencyGraph::from_metadata(self._inner().metadata.values())
    }

    /// Load order for `plugin_id`: transitive dependencies first, the plugin
    /// itself last.
    pub fn resolve_dependencies(&self, plugin_id: &str) -> Result<Vec<String>> {
        self._graph().load_order(plugin_id)
    }

    /// `Err` lists every dependency, direct or transitive, with no metadata.
    pub fn check_dependencies(&self, plugin_id: &str) -> std::result::Result<(), Vec<String>> {
        let graph = self._graph();
        if !graph.contains(plugin_id) {
            return Err(vec![plugin_id.to_string()]);
        }
        let mut missing = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![plugin_id.to_string()];
        while let Some(node) = pending.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            for dep in graph.dependencies_of(&node) {
                if graph.contains(dep) {
                    pending.push(dep.clone());
                } else {
                    missing.insert(dep.clone());
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing.into_iter().collect())
        }
    }

    /// Closed cycle path (e.g. `[A, B, C, A]`) reachable from `plugin_id`.
    pub fn detect_circular_dependencies(&self, plugin_id: &str) -> Option<Vec<String>> {
        self._graph().find_cycle_from(plugin_id)
    }

    pub fn detect_all_circular_dependencies(&self) -> Vec<Vec<String>> {
        self._graph().find_all_cycles()
    }

    /// Loaded plugins that declare `plugin_id` as a direct dependency.
    pub fn dependent_plugins(&self, plugin_id: &str) -> Vec<String> {
        let inner = self._inner();
        let mut dependents: Vec<String> = inner
            .loaded
            .keys()
            .filter(|id| {
                inner
                    .metadata
                    .get(id.as_str())
                    .map(|m| m.depends_on(plugin_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        dependents.sort();
        dependents
    }

    pub fn can_reload_plugin(&self, plugin_id: &str) -> bool {
        self.is_plugin_loaded(plugin_id) && self.dependent_plugins(plugin_id).is_empty()
    }

    pub fn reloadable_plugins(&self) -> Vec<String> {
        self.loaded_plugins()
            .into_iter()
            .filter(|id| self.can_reload_plugin(id))
            .collect()
    }

    fn _report_cycle(&self, plugin_id: &str, cycle: &[String]) {
        let path = cycle.join(" -> ");
        log::error!(
            "plugin.manager.cycle_detected: circular dependency detected - plugin={}, cycle={}",
            plugin_id,
            path
        );
        let sink = self
            .alerts
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_else(|_| Arc::new(EgLogMonitor) as Arc<dyn EgAlertSink>);
        sink.raise_alert(
            EgAlertSeverity::Critical,
            "plugin_manager",
            &format!("circular dependency for plugin '{}': {}", plugin_id, path),
        );
        self.events.publish(EgEvent::DependencyCycleDetected {
            plugin_id: plugin_id.to_string(),
            cycle: cycle.to_vec(),
        });
    }

    fn _report_exception(&self, plugin_id: &str, stage: &str, message: &str) {
        log::error!(
            "plugin.manager.exception: plugin call failed - plugin={}, stage={}, error={}",
            plugin_id,
            stage,
            message
        );
        let handler = self.exception_handler.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            if catch_unwind(AssertUnwindSafe(|| handler(plugin_id, stage, message))).is_err() {
                log::error!(
                    "plugin.manager.handler_panicked: exception handler panicked - plugin={}",
                    plugin_id
                );
            }
        }
    }

    /// Run plugin code, turning errors and panics into reported `Err`s.
    fn _isolated<R>(
        &self,
        plugin_id: &str,
        stage: &str,
        call: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        match catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self._report_exception(plugin_id, stage, &e.to_string());
                Err(e)
            }
            Err(payload) => {
                let message = format!("plugin panicked: {}", panic_message(payload.as_ref()));
                self._report_exception(plugin_id, stage, &message);
                Err(EgError::invocation(plugin_id, stage, message))
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn load_plugin(&self, plugin_id: &str) -> Result<()> {
        let metadata = {
            let mut inner = self._inner();
            while inner.loading.contains(plugin_id) {
                log::debug!(
                    "plugin.manager.load_wait: waiting for load in progress - plugin={}",
                    plugin_id
                );
                inner = self
                    .load_done
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if inner.loaded.contains_key(plugin_id) {
                return Ok(());
            }
            let metadata = inner
                .metadata
                .get(plugin_id)
                .cloned()
                .ok_or_else(|| EgError::not_found("plugin", plugin_id))?;
            let missing: Vec<&str> = metadata
                .dependencies
                .iter()
                .filter(|dep| !inner.metadata.contains_key(dep.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                let message = format!("missing dependencies: {}", missing.join(", "));
                drop(inner);
                log::error!(
                    "plugin.manager.missing_dependencies: plugin cannot load - plugin={}, missing={}",
                    plugin_id,
                    missing.join(",")
                );
                return Err(EgError::dependency(plugin_id, message));
            }
            let cycle = EgDependencyGraph::from_metadata(inner.metadata.values()).find_cycle_from(plugin_id);
            if let Some(cycle) = cycle {
                drop(inner);
                self._report_cycle(plugin_id, &cycle);
                return Err(EgError::dependency(
                    plugin_id,
                    format!("circular dependency: {}", cycle.join(" -> ")),
                ));
            }
            inner.loading.insert(plugin_id.to_string());
            metadata
        };
        let _guard = EgLoadingGuard {
            inner: &self.inner,
            load_done: &self.load_done,
            plugin_id: plugin_id.to_string(),
        };

        for dep in &metadata.dependencies {
            self.load_plugin(dep).map_err(|e| {
                EgError::dependency(plugin_id, format!("dependency '{}' failed to load: {}", dep, e))
            })?;
        }

        let started = Instant::now();
        let result = self._load_single(&metadata);
        let elapsed = started.elapsed();
        if let Ok(monitor) = self.performance.read() {
            monitor.record_plugin_load(plugin_id, elapsed, result.is_ok());
        }

        match result {
            Ok(active) => {
                let services = active.services.len();
                self._inner().loaded.insert(plugin_id.to_string(), active);
                log::info!(
                    "plugin.manager.loaded: plugin loaded - plugin={}, version={}, services={}, duration_ms={}",
                    plugin_id,
                    metadata.version,
                    services,
                    elapsed.as_millis()
                );
                self.events.publish(EgEvent::PluginLoaded {
                    plugin_id: plugin_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "plugin.manager.load_failed: plugin failed to load - plugin={}, error={}",
                    plugin_id,
                    e
                );
                self.events.publish(EgEvent::PluginLoadFailed {
                    plugin_id: plugin_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn _locate_module(&self, plugin_id: &str) -> Result<PathBuf> {
        if let Some(path) = self._inner().module_paths.get(plugin_id).cloned() {
            return Ok(path);
        }
        let candidates = discover_modules(&self.plugin_paths(), self.loader.module_extension());
        for path in candidates {
            if let Ok(metadata) = self.loader.probe(&path) {
                if metadata.plugin_id == plugin_id {
                    self._inner()
                        .module_paths
                        .insert(plugin_id.to_string(), path.clone());
                    return Ok(path);
                }
            }
        }
        Err(EgError::not_found("module", plugin_id))
    }

    fn _context(&self, plugin_id: &str) -> EgPluginContext {
        let config = self
            ._inner()
            .configs
            .get(plugin_id)
            .cloned()
            .unwrap_or(Value::Null);
        EgPluginContext {
            plugin_id: plugin_id.to_string(),
            config,
            registry: self.registry.clone(),
            data_dir: self.config.state_dir.as_ref().map(|d| d.join(plugin_id)),
        }
    }

    fn _load_single(&self, metadata: &EgPluginMetadata) -> Result<EgActivePlugin> {
        let plugin_id = metadata.plugin_id.as_str();
        let path = self._locate_module(plugin_id)?;
        let mut module = if self.config.require_signature {
            let bytes = self.verifier.verify_module_bytes(plugin_id, &path)?;
            let staged = self._stage_verified(plugin_id, &path, &bytes)?;
            let loaded = self.loader.load(&staged);
            _discard_staged(&staged);
            loaded?
        } else {
            self.loader.load(&path)?
        };
        let context = self._context(plugin_id);
        if let Err(e) = self._isolated(plugin_id, "initialize", || module.plugin_mut().initialize(&context)) {
            module.release();
            return Err(e);
        }

        let descriptors = match self._isolated(plugin_id, "services", || Ok(module.plugin().services())) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                self._shutdown(plugin_id, module.plugin_mut());
                module.release();
                return Err(e);
            }
        };

        let mut registered = Vec::new();
        if let Some(registry) = &self.registry {
            for descriptor in descriptors {
                match registry.register_service(descriptor.clone()) {
                    Ok(_) => registered.push(descriptor),
                    Err(e) => {
                        for done in registered.iter().filter_map(|d| d.provider.as_ref()) {
                            registry.unregister_provider(done);
                        }
                        drop(registered);
                        self._shutdown(plugin_id, module.plugin_mut());
                        module.release();
                        return Err(EgError::invocation(
                            plugin_id,
                            "register_service",
                            e.to_string(),
                        ));
                    }
                }
            }
        } else if !descriptors.is_empty() {
            log::debug!(
                "plugin.manager.services_skipped: no registry attached - plugin={}, services={}",
                plugin_id,
                descriptors.len()
            );
        }

        Ok(EgActivePlugin {
            module: Arc::new(Mutex::new(module)),
            services: registered,
            loaded_at_ms: now_millis(),
        })
    }

    /// Write verified module bytes to a fresh private file with the same
    /// file name as `path`.
    fn _stage_verified(&self, plugin_id: &str, path: &Path, bytes: &[u8]) -> Result<PathBuf> {
        let root = match &self.config.state_dir {
            Some(dir) => dir.join(".verified"),
            None => std::env::temp_dir().join("eagle-verified"),
        };
        let seq = STAGE_SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = root.join(format!("{}-{}-{}-{}", plugin_id, std::process::id(), now_millis(), seq));
        fs::create_dir_all(&dir)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| EgError::validation(format!("module path '{}' has no file name", path.display())))?;
        let staged = dir.join(file_name);
        let mut file = fs::File::create(&staged)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        log::debug!(
            "plugin.manager.staged: verified module staged - plugin={}, path={}",
            plugin_id,
            staged.display()
        );
        Ok(staged)
    }

    fn _shutdown(&self, plugin_id: &str, plugin: &mut dyn EgPlugin) {
        let _ = self._isolated(plugin_id, "shutdown", || plugin.shutdown());
    }

    /// Remove a plugin. Idempotent: a plugin that is not loaded is already
    /// in the requested state.
    pub fn unload_plugin(&self, plugin_id: &str) -> Result<()> {
        if !self.unload_loaded(plugin_id) {
            log::debug!(
                "plugin.manager.not_loaded: unload is a no-op - plugin={}",
                plugin_id
            );
        }
        Ok(())
    }

    /// Unload and report whether the plugin was loaded.
    pub(crate) fn unload_loaded(&self, plugin_id: &str) -> bool {
        let Some(active) = self._inner().loaded.remove(plugin_id) else {
            return false;
        };
        let dependents = self.dependent_plugins(plugin_id);
        if !dependents.is_empty() {
            log::warn!(
                "plugin.manager.unload_with_dependents: loaded plugins depend on unloaded plugin - plugin={}, dependents={}",
                plugin_id,
                dependents.join(",")
            );
        }

        let EgActivePlugin { module, services, .. } = active;
        if let Some(registry) = &self.registry {
            for provider in services.iter().filter_map(|d| d.provider.as_ref()) {
                registry.unregister_provider(provider);
            }
        }
        // Providers may point into the module; drop them before it goes.
        drop(services);

        {
            let mut guard = module.lock().unwrap_or_else(PoisonError::into_inner);
            self._shutdown(plugin_id, guard.plugin_mut());
        }
        match Arc::try_unwrap(module) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner).release(),
            Err(_) => log::warn!(
                "plugin.manager.module_shared: module still borrowed, released on last use - plugin={}",
                plugin_id
            ),
        }

        log::info!("plugin.manager.unloaded: plugin unloaded - plugin={}", plugin_id);
        self.events.publish(EgEvent::PluginUnloaded {
            plugin_id: plugin_id.to_string(),
        });
        true
    }

    /// Unload then load. Only a loaded plugin with no loaded dependents can
    /// be reloaded. The module is probed again so a replaced module brings
    /// its new metadata.
    pub fn reload_plugin(&self, plugin_id: &str) -> Result<()> {
        if !self.is_plugin_loaded(plugin_id) {
            return Err(EgError::not_found("loaded plugin", plugin_id));
        }
        let dependents = self.dependent_plugins(plugin_id);
        if !dependents.is_empty() {
            return Err(EgError::dependency(
                plugin_id,
                format!("loaded plugins depend on it: {}", dependents.join(", ")),
            ));
        }
        self.unload_loaded(plugin_id);
        self.refresh_metadata(plugin_id);
        self.load_plugin(plugin_id)
    }

    /// Probe the cached module again and replace the stored metadata.
    pub(crate) fn refresh_metadata(&self, plugin_id: &str) {
        let Some(path) = self._inner().module_paths.get(plugin_id).cloned() else {
            return;
        };
        match self.loader.probe(&path) {
            Ok(metadata) if metadata.plugin_id == plugin_id => {
                self._inner().metadata.insert(plugin_id.to_string(), metadata);
            }
            Ok(metadata) => log::warn!(
                "plugin.manager.module_changed: module now reports another id - plugin={}, reported={}",
                plugin_id,
                metadata.plugin_id
            ),
            Err(e) => log::warn!(
                "plugin.manager.reprobe_failed: keeping previous metadata - plugin={}, error={}",
                plugin_id,
                e
            ),
        }
    }

    /// Unload every plugin, dependents before their dependencies. Returns
    /// the number unloaded.
    pub fn unload_all(&self) -> usize {
        let mut count = 0;
        loop {
            let loaded = self.loaded_plugins();
            if loaded.is_empty() {
                break;
            }
            let next = loaded
                .iter()
                .find(|id| self.dependent_plugins(id).is_empty())
                .unwrap_or(&loaded[0])
                .clone();
            if self.unload_loaded(&next) {
                count += 1;
            }
        }
        count
    }

    // ---------------------------------------------------------------------
    // Runtime access
    // ---------------------------------------------------------------------

    fn _module(&self, plugin_id: &str) -> Option<Arc<Mutex<EgLoadedModule>>> {
        self._inner()
            .loaded
            .get(plugin_id)
            .map(|a| Arc::clone(&a.module))
    }

    /// Run `f` against a loaded plugin, outside the manager lock.
    pub fn with_plugin<R>(&self, plugin_id: &str, f: impl FnOnce(&mut dyn EgPlugin) -> R) -> Option<R> {
        let module = self._module(plugin_id)?;
        let mut guard = module.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(guard.plugin_mut()))
    }

    /// Store `config` and apply it to the plugin if loaded.
    pub fn configure_plugin(&self, plugin_id: &str, config: Value) -> Result<()> {
        {
            let mut inner = self._inner();
            if !inner.metadata.contains_key(plugin_id) {
                return Err(EgError::not_found("plugin", plugin_id));
            }
            inner.configs.insert(plugin_id.to_string(), config.clone());
        }
        if let Some(module) = self._module(plugin_id) {
            let mut guard = module.lock().unwrap_or_else(PoisonError::into_inner);
            self._isolated(plugin_id, "configure", || guard.plugin_mut().configure(&config))?;
        }
        Ok(())
    }

    pub fn plugin_config(&self, plugin_id: &str) -> Option<Value> {
        self._inner().configs.get(plugin_id).cloned()
    }

    pub fn is_plugin_healthy(&self, plugin_id: &str) -> bool {
        let Some(module) = self._module(plugin_id) else {
            return false;
        };
        let guard = module.lock().unwrap_or_else(PoisonError::into_inner);
        self._isolated(plugin_id, "is_healthy", || Ok(guard.plugin().is_healthy()))
            .unwrap_or(false)
    }

    /// Snapshot of a loaded plugin for a later `restore_state`.
    pub fn capture_state(&self, plugin_id: &str) -> Result<EgPluginStateSnapshot> {
        let module = self
            ._module(plugin_id)
            .ok_or_else(|| EgError::not_found("loaded plugin", plugin_id))?;
        let metadata = self
            .get_plugin_metadata(plugin_id)
            .ok_or_else(|| EgError::not_found("plugin", plugin_id))?;
        let mut snapshot = EgPluginStateSnapshot::new(metadata);
        snapshot.config = self.plugin_config(plugin_id).unwrap_or(Value::Null);
        snapshot.loaded_services = self.exported_services(plugin_id);
        let guard = module.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.plugin_state = self._isolated(plugin_id, "save_state", || Ok(guard.plugin().save_state()))?;
        Ok(snapshot)
    }

    /// Apply a snapshot's configuration and plugin state to a loaded plugin.
    pub fn restore_state(&self, plugin_id: &str, snapshot: &EgPluginStateSnapshot) -> Result<()> {
        if snapshot.plugin_id != plugin_id {
            return Err(EgError::validation(format!(
                "snapshot of '{}' cannot restore '{}'",
                snapshot.plugin_id, plugin_id
            )));
        }
        if !self.is_plugin_loaded(plugin_id) {
            return Err(EgError::not_found("loaded plugin", plugin_id));
        }
        if !snapshot.config.is_null() {
            self.configure_plugin(plugin_id, snapshot.config.clone())?;
        }
        if let Some(state) = &snapshot.plugin_state {
            let module = self
                ._module(plugin_id)
                .ok_or_else(|| EgError::not_found("loaded plugin", plugin_id))?;
            let mut guard = module.lock().unwrap_or_else(PoisonError::into_inner);
            self._isolated(plugin_id, "restore_state", || guard.plugin_mut().restore_state(state))?;
        }
        Ok(())
    }
}

impl Drop for EgPluginManager {
    fn drop(&mut self) {
        let unloaded = self.unload_all();
        if unloaded > 0 {
            log::debug!(
                "plugin.manager.dropped: plugins unloaded on drop - count={}",
                unloaded
            );
        }
    }
}

fn _discard_staged(staged: &Path) {
    // A mapped library may outlive its file on Unix; elsewhere removal can
    // fail until the module is released.
    if let Err(e) = fs::remove_file(staged) {
        log::debug!(
            "plugin.manager.stage_kept: staged module not removed - path={}, error={}",
            staged.display(),
            e
        );
        return;
    }
    if let Some(dir) = staged.parent() {
        let _ = fs::remove_dir(dir);
    }
}
