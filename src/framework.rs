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

//! # Eagle Framework
//!
//! Composition root that owns one instance of every component and wires
//! them together. Create as many frameworks as needed; nothing is global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EgFrameworkConfig;
use crate::errors::{EgError, Result};
use crate::events::EgEventBus;
use crate::monitor::EgMetricsCollector;
use crate::plugin::hot_reload::EgHotReloadManager;
use crate::plugin::loader::EgModuleLoader;
use crate::plugin::manager::EgPluginManager;
use crate::service::async_call::EgAsyncServiceCall;
use crate::service::registry::EgServiceRegistry;

pub struct EgFramework {
    config: EgFrameworkConfig,
    events: Arc<EgEventBus>,
    metrics: Arc<EgMetricsCollector>,
    registry: Arc<EgServiceRegistry>,
    async_calls: EgAsyncServiceCall,
    plugins: Arc<EgPluginManager>,
    hot_reload: EgHotReloadManager,
    started: AtomicBool,
}

impl std::fmt::Debug for EgFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgFramework")
            .field("started", &self.is_started())
            .field("registry", &self.registry)
            .field("plugins", &self.plugins)
            .finish()
    }
}

impl EgFramework {
    /// Framework with the default module loader: native shared libraries
    /// when the `native-plugins` feature is on, otherwise an empty static
    /// loader.
    pub fn new(config: EgFrameworkConfig) -> Result<Self> {
        #[cfg(feature = "native-plugins")]
        let loader: Arc<dyn EgModuleLoader> = Arc::new(crate::plugin::loader::EgNativeModuleLoader::new());
        #[cfg(not(feature = "native-plugins"))]
        let loader: Arc<dyn EgModuleLoader> = Arc::new(crate::plugin::loader::EgStaticModuleLoader::new());
        Self::with_loader(config, loader)
    }

    pub fn with_loader(config: EgFrameworkConfig, loader: Arc<dyn EgModuleLoader>) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EgEventBus::new());
        let metrics = Arc::new(EgMetricsCollector::new());

        let registry = Arc::new(EgServiceRegistry::with_event_bus(
            config.services.clone(),
            Arc::clone(&events),
        )?);
        registry.set_performance_monitor(metrics.clone());

        let async_calls = EgAsyncServiceCall::new(Arc::clone(&registry), config.services.worker_threads)?;

        let plugins = EgPluginManager::new(config.plugins.clone(), loader)
            .with_registry(Arc::clone(&registry))
            .with_event_bus(Arc::clone(&events));
        plugins.set_alert_sink(metrics.clone());
        plugins.set_performance_monitor(metrics.clone());
        let plugins = Arc::new(plugins);

        let hot_reload = EgHotReloadManager::new(Arc::clone(&plugins), config.hot_reload.clone());

        log::info!(
            "framework.core.created: framework assembled - plugin_paths={}, workers={}",
            config.plugins.paths.len(),
            async_calls.workers()
        );
        Ok(EgFramework {
            config,
            events,
            metrics,
            registry,
            async_calls,
            plugins,
            hot_reload,
            started: AtomicBool::new(false),
        })
    }

    /// Start event delivery and maintenance, scan the plugin paths and load
    /// the `auto_load` plugins. Every auto-load is attempted; the first
    /// failure is returned.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.events.start_dispatcher()?;
        let interval = self.config.services.maintenance_interval_ms;
        if interval > 0 {
            self.registry.start_maintenance(Duration::from_millis(interval))?;
        }

        let found = self.plugins.scan_plugins();
        let mut first_error: Option<EgError> = None;
        for plugin_id in &self.config.plugins.auto_load {
            if let Err(e) = self.plugins.load_plugin(plugin_id) {
                log::error!(
                    "framework.core.auto_load_failed: auto-load failed - plugin={}, error={}",
                    plugin_id,
                    e
                );
                first_error.get_or_insert(e);
            }
        }
        log::info!(
            "framework.core.started: framework started - discovered={}, loaded={}",
            found.len(),
            self.plugins.loaded_plugins().len()
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unload every plugin and stop maintenance. Returns the number of
    /// plugins unloaded.
    pub fn shutdown(&self) -> usize {
        let unloaded = self.plugins.unload_all();
        self.registry.stop_maintenance();
        if self.started.swap(false, Ordering::SeqCst) {
            log::info!(
                "framework.core.stopped: framework shut down - unloaded={}",
                unloaded
            );
        }
        unloaded
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EgFrameworkConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EgEventBus> {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<EgMetricsCollector> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<EgServiceRegistry> {
        &self.registry
    }

    pub fn async_calls(&self) -> &EgAsyncServiceCall {
        &self.async_calls
    }

    pub fn plugin_manager(&self) -> &Arc<EgPluginManager> {
        &self.plugins
    }

    pub fn hot_reload(&self) -> &EgHotReloadManager {
        &self.hot_reload
    }
}

impl Drop for EgFramework {
    fn drop(&mut self) {
        self.shutdown();
    }
}
