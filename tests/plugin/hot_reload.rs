//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd project team.

use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eagle::plugin::*;
use eagle::service::{EgMethodTable, EgServiceDescriptor, EgServiceRegistry};
use eagle::{EgError, EgEvent, EgRegistryConfig, Result};
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Default)]
struct Switches {
    inits: AtomicUsize,
    fail_init: AtomicBool,
    slow_init: AtomicBool,
}

/// Counter exposed as the `counter` service; the count survives reloads
/// only through save_state/restore_state.
struct CounterPlugin {
    meta: EgPluginMetadata,
    count: Arc<AtomicU64>,
    switches: Arc<Switches>,
}

impl EgPlugin for CounterPlugin {
    fn metadata(&self) -> EgPluginMetadata {
        self.meta.clone()
    }

    fn initialize(&mut self, _context: &EgPluginContext) -> Result<()> {
        if self.switches.fail_init.load(Ordering::SeqCst) {
            return Err(EgError::invocation(&self.meta.plugin_id, "initialize", "disk not ready"));
        }
        if self.switches.slow_init.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(300));
        }
        self.switches.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn services(&self) -> Vec<EgServiceDescriptor> {
        if self.meta.plugin_id != "counter" {
            return Vec::new();
        }
        let incr = Arc::clone(&self.count);
        let get = Arc::clone(&self.count);
        let provider = EgMethodTable::new()
            .with_method("incr", move |_| Ok(json!(incr.fetch_add(1, Ordering::SeqCst) + 1)))
            .with_method("get", move |_| Ok(json!(get.load(Ordering::SeqCst))))
            .into_handle();
        vec![EgServiceDescriptor::new("counter", "1.0.0").with_provider(provider)]
    }

    fn save_state(&self) -> Option<Value> {
        Some(json!({ "count": self.count.load(Ordering::SeqCst) }))
    }

    fn restore_state(&mut self, state: &Value) -> Result<()> {
        let count = state
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| EgError::validation("snapshot has no count"))?;
        self.count.store(count, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _modules: TempDir,
    state_dir: TempDir,
    registry: Arc<EgServiceRegistry>,
    switches: Arc<Switches>,
    manager: Arc<EgPluginManager>,
}

impl Harness {
    fn new(plugins: &[(&'static str, &[&'static str])]) -> Self {
        let modules = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let switches = Arc::new(Switches::default());
        let loader = EgStaticModuleLoader::new();
        for (id, deps) in plugins {
            fs::write(modules.path().join(format!("{}.{}", id, DLL_EXTENSION)), id.as_bytes()).unwrap();
            let mut meta = EgPluginMetadata::new(*id, "1.0.0");
            for dep in deps.iter() {
                meta = meta.with_dependency(*dep);
            }
            let switches = Arc::clone(&switches);
            loader.register(*id, move || {
                Box::new(CounterPlugin {
                    meta: meta.clone(),
                    count: Arc::new(AtomicU64::new(0)),
                    switches: Arc::clone(&switches),
                })
            });
        }

        let registry = Arc::new(EgServiceRegistry::new(EgRegistryConfig::default()).unwrap());
        let config = EgPluginManagerConfig {
            paths: vec![modules.path().to_path_buf()],
            state_dir: Some(state_dir.path().to_path_buf()),
            ..Default::default()
        };
        let loader: Arc<dyn EgModuleLoader> = Arc::new(loader);
        let manager = EgPluginManager::new(config, loader).with_registry(Arc::clone(&registry));
        manager.scan_plugins();
        Harness {
            _modules: modules,
            state_dir,
            registry,
            switches,
            manager: Arc::new(manager),
        }
    }

    fn reloader(&self, grace_ms: u64, persist_state: bool) -> EgHotReloadManager {
        EgHotReloadManager::new(
            Arc::clone(&self.manager),
            EgHotReloadConfig {
                grace_ms,
                persist_state,
            },
        )
    }

    fn call(&self, method: &str) -> Value {
        self.registry.call_service("counter", method, &[], None).unwrap()
    }

    fn inits(&self) -> usize {
        self.switches.inits.load(Ordering::SeqCst)
    }
}

#[test]
fn test_reload_carries_state_into_new_instance() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    for _ in 0..3 {
        harness.call("incr");
    }

    let reloader = harness.reloader(0, false);
    let result = reloader.reload_plugin("counter", false);
    assert!(result.success, "{:?}", result.error);
    assert!(result.state_saved);
    assert!(result.state_restored);
    assert_eq!(harness.inits(), 2);
    assert_eq!(harness.call("get"), json!(3));
    assert_eq!(harness.call("incr"), json!(4));
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Idle);
}

#[test]
fn test_reload_walks_through_every_state() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    harness.manager.event_bus().subscribe(move |event| {
        if let EgEvent::ReloadStateChanged { state, .. } = event {
            sink.lock().unwrap().push(state.clone());
        }
    });

    let reloader = harness.reloader(0, false);
    assert!(reloader.reload_plugin("counter", false).success);
    harness.manager.event_bus().dispatch_pending();
    assert_eq!(
        *states.lock().unwrap(),
        vec!["saving", "unloading", "loading", "restoring", "success", "idle"]
    );
}

#[test]
fn test_dependents_block_reload_unless_forced() {
    let harness = Harness::new(&[("counter", &[]), ("dashboard", &["counter"])]);
    harness.manager.load_plugin("dashboard").unwrap();
    assert_eq!(harness.inits(), 2);

    let reloader = harness.reloader(0, false);
    let refused = reloader.reload_plugin("counter", false);
    assert!(!refused.success);
    assert!(refused.error.as_deref().unwrap_or("").contains("dashboard"));
    assert_eq!(harness.inits(), 2);
    assert!(harness.manager.is_plugin_loaded("counter"));

    let forced = reloader.reload_plugin("counter", true);
    assert!(forced.success, "{:?}", forced.error);
    assert_eq!(harness.inits(), 3);
    assert!(harness.manager.is_plugin_loaded("dashboard"));
}

#[test]
fn test_second_reload_is_rejected_while_first_runs() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    harness.call("incr");
    let reloader = Arc::new(harness.reloader(0, false));

    harness.switches.slow_init.store(true, Ordering::SeqCst);
    let first = {
        let reloader = Arc::clone(&reloader);
        thread::spawn(move || reloader.reload_plugin("counter", false))
    };
    thread::sleep(Duration::from_millis(80));

    let second = reloader.reload_plugin("counter", false);
    assert!(!second.success);
    assert!(!second.state_saved);
    assert!(second.error.as_deref().unwrap_or("").contains("in progress"));
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Loading);

    let first = first.join().unwrap();
    assert!(first.success, "{:?}", first.error);
    assert!(first.state_restored);
    assert_eq!(harness.inits(), 2);
    assert_eq!(harness.call("get"), json!(1));
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Idle);
}

#[test]
fn test_reload_of_unloaded_plugin_fails() {
    let harness = Harness::new(&[("counter", &[])]);
    let reloader = harness.reloader(0, false);
    let result = reloader.reload_plugin("counter", false);
    assert!(!result.success);
    assert!(!result.state_saved);
    assert_eq!(harness.inits(), 0);
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Idle);
}

#[test]
fn test_outcome_stays_visible_for_grace_period() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    let reloader = harness.reloader(60, false);

    assert!(reloader.reload_plugin("counter", false).success);
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Success);
    thread::sleep(Duration::from_millis(250));
    assert_eq!(reloader.reload_state("counter"), EgReloadState::Idle);
}

#[test]
fn test_failed_load_leaves_snapshot_for_recovery() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    harness.call("incr");
    harness.call("incr");
    let reloader = harness.reloader(0, true);

    harness.switches.fail_init.store(true, Ordering::SeqCst);
    let result = reloader.reload_plugin("counter", false);
    assert!(!result.success);
    assert!(result.state_saved);
    assert!(!result.state_restored);
    assert!(!harness.manager.is_plugin_loaded("counter"));

    let snapshot = reloader.recover_snapshot("counter").unwrap().unwrap();
    assert_eq!(snapshot.plugin_state, Some(json!({ "count": 2 })));
    assert_eq!(snapshot.loaded_services, vec!["counter@1.0.0"]);
    assert!(harness
        .state_dir
        .path()
        .join("counter.snapshot.json")
        .is_file());

    harness.switches.fail_init.store(false, Ordering::SeqCst);
    harness.manager.load_plugin("counter").unwrap();
    harness.manager.restore_state("counter", &snapshot).unwrap();
    assert_eq!(harness.call("get"), json!(2));
}

#[test]
fn test_successful_reload_cleans_up_snapshot() {
    let harness = Harness::new(&[("counter", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    let reloader = harness.reloader(0, true);

    assert!(reloader.reload_plugin("counter", false).success);
    assert!(reloader.recover_snapshot("counter").unwrap().is_none());
}

#[test]
fn test_batch_reports_each_plugin() {
    let harness = Harness::new(&[("counter", &[]), ("audit", &[])]);
    harness.manager.load_plugin("counter").unwrap();
    harness.manager.load_plugin("audit").unwrap();
    let reloader = harness.reloader(0, false);

    let batch = reloader.reload_plugins(["counter", "audit"], false);
    assert!(batch.success);
    assert_eq!(batch.results.len(), 2);

    let batch = reloader.reload_plugins(vec!["audit".to_string(), "ghost".to_string()], false);
    assert!(!batch.success);
    assert_eq!(batch.failed(), vec!["ghost"]);
}
