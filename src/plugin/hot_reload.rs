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

//! # Hot Reload
//!
//! `save → unload → load → restore` for a running plugin. Saving and
//! restoring are best-effort; unloading and loading decide the outcome.
//!
//! Per-plugin state runs `Idle → Saving → Unloading → Loading → Restoring →
//! Success | Failed` and returns to `Idle` after the grace delay. Entering
//! `Saving` is the claim on a plugin: a reload requested while another is
//! underway is rejected and leaves the running one's state alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::events::{EgEvent, EgEventBus};
use crate::plugin::manager::EgPluginManager;
use crate::plugin::state::{EgPluginStateSnapshot, EgStateStore};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgReloadState {
    #[default]
    Idle,
    Saving,
    Unloading,
    Loading,
    Restoring,
    Success,
    Failed,
}

impl EgReloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgReloadState::Idle => "idle",
            EgReloadState::Saving => "saving",
            EgReloadState::Unloading => "unloading",
            EgReloadState::Loading => "loading",
            EgReloadState::Restoring => "restoring",
            EgReloadState::Success => "success",
            EgReloadState::Failed => "failed",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            EgReloadState::Saving
                | EgReloadState::Unloading
                | EgReloadState::Loading
                | EgReloadState::Restoring
        )
    }
}

/// `hot_reload` configuration section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgHotReloadConfig {
    /// How long `Success`/`Failed` stays visible before `Idle`.
    pub grace_ms: u64,
    /// Write snapshots to the plugin state directory during a reload.
    pub persist_state: bool,
}

impl Default for EgHotReloadConfig {
    fn default() -> Self {
        EgHotReloadConfig {
            grace_ms: 1000,
            persist_state: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EgReloadResult {
    pub plugin_id: String,
    pub success: bool,
    pub state_saved: bool,
    pub state_restored: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

impl EgReloadResult {
    fn new(plugin_id: &str) -> Self {
        EgReloadResult {
            plugin_id: plugin_id.to_string(),
            success: false,
            state_saved: false,
            state_restored: false,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EgBatchReloadResult {
    /// True only when every reload succeeded.
    pub success: bool,
    pub results: Vec<EgReloadResult>,
}

impl EgBatchReloadResult {
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.plugin_id.as_str())
            .collect()
    }
}

type EgReloadStates = Arc<Mutex<HashMap<String, (EgReloadState, u64)>>>;

pub struct EgHotReloadManager {
    manager: Arc<EgPluginManager>,
    config: EgHotReloadConfig,
    store: Option<EgStateStore>,
    events: Arc<EgEventBus>,
    states: EgReloadStates,
}

impl std::fmt::Debug for EgHotReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgHotReloadManager")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish()
    }
}

impl EgHotReloadManager {
    pub fn new(manager: Arc<EgPluginManager>, config: EgHotReloadConfig) -> Self {
        let store = if config.persist_state {
            manager.config().state_dir.clone().map(EgStateStore::new)
        } else {
            None
        };
        if config.persist_state && store.is_none() {
            log::warn!("plugin.reload.no_state_dir: persist_state is set but plugins.state_dir is not");
        }
        let events = Arc::clone(manager.event_bus());
        EgHotReloadManager {
            manager,
            config,
            store,
            events,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn plugin_manager(&self) -> &Arc<EgPluginManager> {
        &self.manager
    }

    pub fn config(&self) -> &EgHotReloadConfig {
        &self.config
    }

    pub fn reload_state(&self, plugin_id: &str) -> EgReloadState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin_id)
            .map(|(state, _)| *state)
            .unwrap_or_default()
    }

    /// Snapshot left on disk by an interrupted reload.
    pub fn recover_snapshot(&self, plugin_id: &str) -> Result<Option<EgPluginStateSnapshot>> {
        match &self.store {
            Some(store) => store.load(plugin_id),
            None => Ok(None),
        }
    }

    /// Move an idle or finished plugin to `Saving`. Fails when a reload of
    /// the plugin is already underway.
    fn _begin(&self, plugin_id: &str) -> bool {
        {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = states
                .entry(plugin_id.to_string())
                .or_insert((EgReloadState::Idle, 0));
            if entry.0.is_in_progress() {
                return false;
            }
            entry.0 = EgReloadState::Saving;
            entry.1 += 1;
        }
        log::debug!(
            "plugin.reload.state: reload state changed - plugin={}, state={}",
            plugin_id,
            EgReloadState::Saving.as_str()
        );
        self.events.publish(EgEvent::ReloadStateChanged {
            plugin_id: plugin_id.to_string(),
            state: EgReloadState::Saving.as_str().to_string(),
        });
        true
    }

    fn _set_state(&self, plugin_id: &str, state: EgReloadState) -> u64 {
        let generation = {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = states
                .entry(plugin_id.to_string())
                .or_insert((EgReloadState::Idle, 0));
            entry.0 = state;
            entry.1 += 1;
            entry.1
        };
        log::debug!(
            "plugin.reload.state: reload state changed - plugin={}, state={}",
            plugin_id,
            state.as_str()
        );
        self.events.publish(EgEvent::ReloadStateChanged {
            plugin_id: plugin_id.to_string(),
            state: state.as_str().to_string(),
        });
        generation
    }

    /// Return to `Idle` after the grace delay unless another reload began.
    fn _schedule_idle(&self, plugin_id: &str, generation: u64) {
        if self.config.grace_ms == 0 {
            self._set_state(plugin_id, EgReloadState::Idle);
            return;
        }
        let states = Arc::clone(&self.states);
        let events = Arc::clone(&self.events);
        let grace = Duration::from_millis(self.config.grace_ms);
        let key = plugin_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("eagle-reload-{}", plugin_id))
            .spawn(move || {
                let plugin_id = key;
                thread::sleep(grace);
                let reset = {
                    let mut states = states.lock().unwrap_or_else(PoisonError::into_inner);
                    match states.get_mut(&plugin_id) {
                        Some(entry) if entry.1 == generation => {
                            entry.0 = EgReloadState::Idle;
                            entry.1 += 1;
                            true
                        }
                        _ => false,
                    }
                };
                if reset {
                    events.publish(EgEvent::ReloadStateChanged {
                        plugin_id,
                        state: EgReloadState::Idle.as_str().to_string(),
                    });
                }
            });
        if let Err(e) = spawned {
            log::warn!(
                "plugin.reload.grace_thread_failed: resetting immediately - error={}",
                e
            );
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = states.get_mut(plugin_id) {
                if entry.1 == generation {
                    entry.0 = EgReloadState::Idle;
                }
            }
        }
    }

    fn _finish(&self, mut result: EgReloadResult, started: Instant, error: Option<String>) -> EgReloadResult {
        result.duration = started.elapsed();
        result.success = error.is_none();
        let state = if result.success {
            EgReloadState::Success
        } else {
            EgReloadState::Failed
        };
        match &error {
            None => log::info!(
                "plugin.reload.completed: plugin reloaded - plugin={}, state_restored={}, duration_ms={}",
                result.plugin_id,
                result.state_restored,
                result.duration.as_millis()
            ),
            Some(e) => log::error!(
                "plugin.reload.failed: plugin reload failed - plugin={}, error={}",
                result.plugin_id,
                e
            ),
        }
        result.error = error;
        let generation = self._set_state(&result.plugin_id, state);
        self._schedule_idle(&result.plugin_id, generation);
        result
    }

    /// Reload one plugin. `force` skips the loaded-dependents check.
    pub fn reload_plugin(&self, plugin_id: &str, force: bool) -> EgReloadResult {
        let started = Instant::now();
        let mut result = EgReloadResult::new(plugin_id);

        if !self._begin(plugin_id) {
            log::warn!(
                "plugin.reload.busy: reload already in progress - plugin={}",
                plugin_id
            );
            result.error = Some(format!("reload of '{}' already in progress", plugin_id));
            result.duration = started.elapsed();
            return result;
        }
        if !self.manager.is_plugin_loaded(plugin_id) {
            return self._finish(result, started, Some(format!("plugin '{}' is not loaded", plugin_id)));
        }
        if !force {
            let dependents = self.manager.dependent_plugins(plugin_id);
            if !dependents.is_empty() {
                return self._finish(
                    result,
                    started,
                    Some(format!("loaded plugins depend on it: {}", dependents.join(", "))),
                );
            }
        }

        self._run(result, started)
    }

    fn _run(&self, mut result: EgReloadResult, started: Instant) -> EgReloadResult {
        let plugin_id = result.plugin_id.clone();

        let snapshot = match self.manager.capture_state(&plugin_id) {
            Ok(snapshot) => {
                result.state_saved = true;
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&snapshot) {
                        log::warn!(
                            "plugin.reload.persist_failed: snapshot not persisted - plugin={}, error={}",
                            plugin_id,
                            e
                        );
                    }
                }
                Some(snapshot)
            }
            Err(e) => {
                log::warn!(
                    "plugin.reload.save_failed: continuing without state - plugin={}, error={}",
                    plugin_id,
                    e
                );
                None
            }
        };

        self._set_state(&plugin_id, EgReloadState::Unloading);
        if !self.manager.unload_loaded(&plugin_id) {
            return self._finish(result, started, Some(format!("plugin '{}' was not loaded", plugin_id)));
        }
        self.manager.refresh_metadata(&plugin_id);

        self._set_state(&plugin_id, EgReloadState::Loading);
        if let Err(e) = self.manager.load_plugin(&plugin_id) {
            return self._finish(result, started, Some(e.to_string()));
        }

        if let Some(snapshot) = snapshot {
            self._set_state(&plugin_id, EgReloadState::Restoring);
            match self.manager.restore_state(&plugin_id, &snapshot) {
                Ok(()) => result.state_restored = true,
                Err(e) => log::warn!(
                    "plugin.reload.restore_failed: plugin reloaded without state - plugin={}, error={}",
                    plugin_id,
                    e
                ),
            }
            if let Some(store) = &self.store {
                if let Err(e) = store.remove(&plugin_id) {
                    log::debug!(
                        "plugin.reload.cleanup_failed: stale snapshot left - plugin={}, error={}",
                        plugin_id,
                        e
                    );
                }
            }
        }

        self._finish(result, started, None)
    }

    /// Reload each plugin in order. Succeeds only if all of them do.
    pub fn reload_plugins<I, S>(&self, plugin_ids: I, force: bool) -> EgBatchReloadResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let results: Vec<EgReloadResult> = plugin_ids
            .into_iter()
            .map(|id| self.reload_plugin(id.as_ref(), force))
            .collect();
        EgBatchReloadResult {
            success: results.iter().all(|r| r.success),
            results,
        }
    }
}
