//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd project team.

use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eagle::plugin::*;
use eagle::service::{EgMethodTable, EgServiceDescriptor, EgServiceRegistry};
use eagle::{EgError, EgEvent, EgRegistryConfig, Result};
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

#[derive(Default)]
struct Probe {
    inits: AtomicUsize,
    shutdowns: AtomicUsize,
    order: Mutex<Vec<String>>,
    configs: Mutex<Vec<Value>>,
}

struct TestPlugin {
    meta: EgPluginMetadata,
    probe: Arc<Probe>,
}

impl EgPlugin for TestPlugin {
    fn metadata(&self) -> EgPluginMetadata {
        self.meta.clone()
    }

    fn initialize(&mut self, context: &EgPluginContext) -> Result<()> {
        if self.meta.plugin_id == "exploding" {
            panic!("initialize blew up");
        }
        if self.meta.plugin_id == "sluggish" {
            thread::sleep(Duration::from_millis(300));
        }
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        self.probe.order.lock().unwrap().push(context.plugin_id.clone());
        if !context.config.is_null() {
            self.probe.configs.lock().unwrap().push(context.config.clone());
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn configure(&mut self, config: &Value) -> Result<()> {
        self.probe.configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    fn services(&self) -> Vec<EgServiceDescriptor> {
        let hello = || {
            EgMethodTable::new()
                .with_method("hello", |_| Ok(json!("hello from greeter")))
                .into_handle()
        };
        match self.meta.plugin_id.as_str() {
            "greeter" => vec![EgServiceDescriptor::new("greeting", "1.0.0").with_provider(hello())],
            "broken" => vec![
                EgServiceDescriptor::new("good-svc", "1.0.0").with_provider(hello()),
                EgServiceDescriptor::new("bad-svc", "1.0.0")
                    .with_provider(hello())
                    .with_methods(["missing"]),
            ],
            _ => Vec::new(),
        }
    }
}

struct Harness {
    dir: TempDir,
    loader: Arc<EgStaticModuleLoader>,
    probe: Arc<Probe>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            dir: tempfile::tempdir().unwrap(),
            loader: Arc::new(EgStaticModuleLoader::new()),
            probe: Arc::new(Probe::default()),
        }
    }

    fn module_path(&self, id: &str) -> PathBuf {
        self.dir.path().join(format!("{}.{}", id, DLL_EXTENSION))
    }

    fn add(&self, id: &'static str, deps: &[&'static str]) -> &Self {
        fs::write(self.module_path(id), format!("module {}", id)).unwrap();
        let mut meta = EgPluginMetadata::new(id, "1.0.0");
        for dep in deps {
            meta = meta.with_dependency(*dep);
        }
        let probe = Arc::clone(&self.probe);
        self.loader.register(id, move || {
            Box::new(TestPlugin {
                meta: meta.clone(),
                probe: Arc::clone(&probe),
            })
        });
        self
    }

    fn config(&self) -> EgPluginManagerConfig {
        EgPluginManagerConfig {
            paths: vec![self.dir.path().to_path_buf()],
            ..Default::default()
        }
    }

    fn manager_with(&self, config: EgPluginManagerConfig) -> EgPluginManager {
        let loader: Arc<dyn EgModuleLoader> = self.loader.clone();
        let manager = EgPluginManager::new(config, loader);
        manager.scan_plugins();
        manager
    }

    fn manager(&self) -> EgPluginManager {
        self.manager_with(self.config())
    }

    fn inits(&self) -> usize {
        self.probe.inits.load(Ordering::SeqCst)
    }
}

#[test]
fn test_scan_records_metadata_without_loading() {
    let harness = Harness::new();
    harness.add("beta", &[]).add("alpha", &["beta"]);
    fs::write(harness.dir.path().join("readme.txt"), b"not a module").unwrap();
    fs::write(harness.module_path("orphan"), b"no factory").unwrap();

    let loader: Arc<dyn EgModuleLoader> = harness.loader.clone();
    let manager = EgPluginManager::new(harness.config(), loader);
    assert_eq!(manager.scan_plugins(), vec!["alpha", "beta"]);
    assert_eq!(manager.available_plugins(), vec!["alpha", "beta"]);
    assert_eq!(
        manager.get_plugin_metadata("alpha").unwrap().dependencies,
        vec!["beta".to_string()]
    );
    assert!(manager.loaded_plugins().is_empty());
    assert_eq!(harness.inits(), 0);
}

#[test]
fn test_load_is_idempotent_and_unload_allows_reload() {
    let harness = Harness::new();
    harness.add("solo", &[]);
    let manager = harness.manager();

    manager.load_plugin("solo").unwrap();
    manager.load_plugin("solo").unwrap();
    assert_eq!(harness.inits(), 1);
    assert!(manager.is_plugin_loaded("solo"));
    assert!(manager.loaded_at("solo").is_some());
    assert!(manager.is_plugin_healthy("solo"));

    manager.unload_plugin("solo").unwrap();
    manager.unload_plugin("solo").unwrap();
    assert!(!manager.is_plugin_loaded("solo"));
    assert_eq!(harness.probe.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!manager.is_plugin_healthy("solo"));

    manager.load_plugin("solo").unwrap();
    assert_eq!(harness.inits(), 2);
}

#[test]
fn test_dependencies_initialize_before_dependents() {
    let harness = Harness::new();
    harness.add("app", &["cache", "db"]).add("cache", &["db"]).add("db", &[]);
    let manager = harness.manager();

    assert_eq!(manager.resolve_dependencies("app").unwrap(), vec!["db", "cache", "app"]);
    assert_eq!(manager.check_dependencies("app"), Ok(()));
    manager.load_plugin("app").unwrap();
    assert_eq!(*harness.probe.order.lock().unwrap(), vec!["db", "cache", "app"]);
    assert_eq!(manager.dependent_plugins("db"), vec!["app", "cache"]);

    assert_eq!(manager.unload_all(), 3);
    assert_eq!(harness.probe.shutdowns.load(Ordering::SeqCst), 3);
}

#[test]
fn test_missing_dependency_fails_without_side_effects() {
    let harness = Harness::new();
    harness.add("app", &["ghost"]);
    let manager = harness.manager();

    assert_eq!(manager.check_dependencies("app"), Err(vec!["ghost".to_string()]));
    assert!(matches!(manager.load_plugin("app"), Err(EgError::Dependency { .. })));
    assert!(matches!(manager.load_plugin("nobody"), Err(EgError::NotFound { .. })));
    assert_eq!(harness.inits(), 0);
    assert!(manager.loaded_plugins().is_empty());
}

#[test]
fn test_three_plugin_cycle_is_reported() {
    let harness = Harness::new();
    harness.add("a", &["b"]).add("b", &["c"]).add("c", &["a"]);
    let manager = harness.manager();

    let cycles = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&cycles);
    manager.event_bus().subscribe(move |event| {
        if let EgEvent::DependencyCycleDetected { cycle, .. } = event {
            sink.lock().unwrap().push(cycle.clone());
        }
    });

    assert_eq!(
        manager.detect_circular_dependencies("a").unwrap(),
        vec!["a", "b", "c", "a"]
    );
    assert!(matches!(manager.load_plugin("a"), Err(EgError::Dependency { .. })));
    assert_eq!(harness.inits(), 0);
    manager.event_bus().dispatch_pending();
    assert_eq!(*cycles.lock().unwrap(), vec![vec!["a", "b", "c", "a"]]);
    assert_eq!(manager.detect_all_circular_dependencies().len(), 1);
}

#[test]
fn test_initialize_panic_reaches_exception_handler() {
    let harness = Harness::new();
    harness.add("exploding", &[]).add("steady", &[]);
    let manager = harness.manager();
    let reported: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    manager.set_exception_handler(move |plugin, stage, message| {
        sink.lock()
            .unwrap()
            .push((plugin.to_string(), stage.to_string(), message.to_string()));
    });

    let err = manager.load_plugin("exploding").unwrap_err();
    assert!(matches!(err, EgError::Invocation { .. }));
    assert!(!manager.is_plugin_loaded("exploding"));

    let reported = reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, "exploding");
    assert_eq!(reported[0].1, "initialize");
    assert!(reported[0].2.contains("initialize blew up"));

    manager.load_plugin("steady").unwrap();
    assert_eq!(manager.loaded_plugins(), vec!["steady"]);
}

#[test]
fn test_exported_services_follow_the_plugin() {
    let harness = Harness::new();
    harness.add("greeter", &[]);
    let registry = Arc::new(EgServiceRegistry::new(EgRegistryConfig::default()).unwrap());
    let manager = harness.manager().with_registry(Arc::clone(&registry));

    manager.load_plugin("greeter").unwrap();
    assert_eq!(manager.exported_services("greeter"), vec!["greeting@1.0.0"]);
    assert_eq!(
        registry.call_service("greeting", "hello", &[], None).unwrap(),
        json!("hello from greeter")
    );

    manager.unload_plugin("greeter").unwrap();
    assert!(!registry.has_service("greeting"));
    assert!(registry.service_instances("greeting").is_empty());
}

#[test]
fn test_failed_service_registration_rolls_back() {
    let harness = Harness::new();
    harness.add("broken", &[]);
    let registry = Arc::new(EgServiceRegistry::new(EgRegistryConfig::default()).unwrap());
    let manager = harness.manager().with_registry(Arc::clone(&registry));

    assert!(matches!(manager.load_plugin("broken"), Err(EgError::Invocation { .. })));
    assert!(!manager.is_plugin_loaded("broken"));
    assert!(!registry.has_service("good-svc"));
    assert!(!registry.has_service("bad-svc"));
    assert_eq!(harness.probe.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_configuration_reaches_plugin() {
    let harness = Harness::new();
    harness.add("tuned", &[]);
    let manager = harness.manager();

    assert!(matches!(
        manager.configure_plugin("unknown", json!({})),
        Err(EgError::NotFound { .. })
    ));
    manager.configure_plugin("tuned", json!({"level": 1})).unwrap();
    manager.load_plugin("tuned").unwrap();
    manager.configure_plugin("tuned", json!({"level": 2})).unwrap();

    assert_eq!(
        *harness.probe.configs.lock().unwrap(),
        vec![json!({"level": 1}), json!({"level": 2})]
    );
    assert_eq!(manager.plugin_config("tuned"), Some(json!({"level": 2})));
}

#[test]
fn test_reload_is_refused_while_dependents_are_loaded() {
    let harness = Harness::new();
    harness.add("app", &["db"]).add("db", &[]);
    let manager = harness.manager();
    manager.load_plugin("app").unwrap();

    assert!(!manager.can_reload_plugin("db"));
    assert!(matches!(manager.reload_plugin("db"), Err(EgError::Dependency { .. })));
    assert_eq!(harness.inits(), 2);

    manager.reload_plugin("app").unwrap();
    assert_eq!(harness.inits(), 3);
    assert_eq!(manager.reloadable_plugins(), vec!["app"]);
}

#[test]
fn test_reload_of_never_loaded_plugin_is_refused() {
    let harness = Harness::new();
    harness.add("solo", &[]);
    let manager = harness.manager();

    assert!(!manager.can_reload_plugin("solo"));
    assert!(matches!(manager.reload_plugin("solo"), Err(EgError::NotFound { .. })));
    assert!(!manager.is_plugin_loaded("solo"));
    assert_eq!(harness.inits(), 0);
}

#[test]
fn test_concurrent_loads_share_a_slow_dependency() {
    let harness = Harness::new();
    harness
        .add("sluggish", &[])
        .add("left", &["sluggish"])
        .add("right", &["sluggish"]);
    let manager = Arc::new(harness.manager());

    let first = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.load_plugin("left"))
    };
    thread::sleep(Duration::from_millis(50));
    let second = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.load_plugin("right"))
    };

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    assert_eq!(manager.loaded_plugins(), vec!["left", "right", "sluggish"]);
    let order = harness.probe.order.lock().unwrap();
    assert_eq!(order.iter().filter(|id| *id == "sluggish").count(), 1);
    assert_eq!(harness.inits(), 3);
}

#[test]
fn test_lifecycle_events_are_published() {
    let harness = Harness::new();
    harness.add("solo", &[]);
    let manager = harness.manager();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.event_bus().subscribe(move |event| match event {
        EgEvent::PluginLoaded { plugin_id } => sink.lock().unwrap().push(format!("loaded:{}", plugin_id)),
        EgEvent::PluginUnloaded { plugin_id } => {
            sink.lock().unwrap().push(format!("unloaded:{}", plugin_id))
        }
        _ => {}
    });

    manager.load_plugin("solo").unwrap();
    manager.unload_plugin("solo").unwrap();
    manager.event_bus().dispatch_pending();
    assert_eq!(*seen.lock().unwrap(), vec!["loaded:solo", "unloaded:solo"]);
}

#[test]
fn test_required_signature_gates_loading() {
    let harness = Harness::new();
    harness.add("signed", &[]).add("unsigned", &[]);
    let signer = EgPluginSigner::generate("dev").unwrap();
    let certificate = signer
        .self_certificate("100", Duration::from_secs(3600))
        .unwrap();
    signer
        .sign_module("signed", &harness.module_path("signed"), certificate)
        .unwrap();

    let manager = harness.manager_with(EgPluginManagerConfig {
        require_signature: true,
        ..harness.config()
    });
    manager.load_plugin("signed").unwrap();
    assert!(matches!(
        manager.load_plugin("unsigned"),
        Err(EgError::Signature { .. })
    ));
    assert!(!manager.is_plugin_loaded("unsigned"));
}

#[test]
fn test_verified_copy_is_loaded_and_cleaned_up() {
    let harness = Harness::new();
    harness.add("signed", &[]);
    let signer = EgPluginSigner::generate("dev").unwrap();
    let certificate = signer
        .self_certificate("102", Duration::from_secs(3600))
        .unwrap();
    signer
        .sign_module("signed", &harness.module_path("signed"), certificate)
        .unwrap();

    let state_dir = tempfile::tempdir().unwrap();
    let manager = harness.manager_with(EgPluginManagerConfig {
        require_signature: true,
        state_dir: Some(state_dir.path().to_path_buf()),
        ..harness.config()
    });
    manager.load_plugin("signed").unwrap();
    assert_eq!(harness.inits(), 1);

    let staging = state_dir.path().join(".verified");
    assert!(staging.is_dir());
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
}

#[test]
fn test_tampered_module_is_rejected() {
    let harness = Harness::new();
    harness.add("signed", &[]);
    let signer = EgPluginSigner::generate("dev").unwrap();
    let certificate = signer
        .self_certificate("101", Duration::from_secs(3600))
        .unwrap();
    signer
        .sign_module("signed", &harness.module_path("signed"), certificate)
        .unwrap();
    fs::write(harness.module_path("signed"), b"patched module").unwrap();

    let manager = harness.manager_with(EgPluginManagerConfig {
        require_signature: true,
        ..harness.config()
    });
    assert!(matches!(manager.load_plugin("signed"), Err(EgError::Signature { .. })));
    assert_eq!(harness.inits(), 0);
}

fn ring_manager(size: usize) -> EgPluginManager {
    let loader: Arc<dyn EgModuleLoader> = Arc::new(EgStaticModuleLoader::new());
    let manager = EgPluginManager::new(EgPluginManagerConfig::default(), loader);
    for i in 0..size {
        let meta = EgPluginMetadata::new(format!("p{}", i), "1.0.0")
            .with_dependency(format!("p{}", (i + 1) % size));
        manager.register_metadata(meta, None).unwrap();
    }
    manager
}

proptest! {
    #[test]
    fn prop_ring_cycle_is_closed_path(size in 2usize..7, start in 0usize..7) {
        let start = start % size;
        let manager = ring_manager(size);
        let from = format!("p{}", start);
        let cycle = manager.detect_circular_dependencies(&from).unwrap();

        prop_assert_eq!(cycle.len(), size + 1);
        prop_assert_eq!(cycle.first(), Some(&from));
        prop_assert_eq!(cycle.last(), Some(&from));
        let expected: Vec<String> = (0..=size).map(|k| format!("p{}", (start + k) % size)).collect();
        prop_assert_eq!(&cycle, &expected);
        prop_assert!(manager.load_plugin(&from).is_err());
        prop_assert_eq!(manager.detect_all_circular_dependencies().len(), 1);
    }

    #[test]
    fn prop_chain_has_no_cycle(size in 1usize..7) {
        let loader: Arc<dyn EgModuleLoader> = Arc::new(EgStaticModuleLoader::new());
        let manager = EgPluginManager::new(EgPluginManagerConfig::default(), loader);
        for i in 0..size {
            let mut meta = EgPluginMetadata::new(format!("p{}", i), "1.0.0");
            if i + 1 < size {
                meta = meta.with_dependency(format!("p{}", i + 1));
            }
            manager.register_metadata(meta, None).unwrap();
        }
        prop_assert!(manager.detect_circular_dependencies("p0").is_none());
        let order = manager.resolve_dependencies("p0").unwrap();
        prop_assert_eq!(order.len(), size);
        prop_assert_eq!(order.last().map(String::as_str), Some("p0"));
    }
}
