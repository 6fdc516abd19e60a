//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd project team.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eagle::service::*;
use eagle::{EgError, EgRetryPolicyConfig};
use serde_json::{json, Value};

fn registry() -> Arc<EgServiceRegistry> {
    let config = EgRegistryConfig {
        retry: EgRetryPolicyConfig {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let registry = Arc::new(EgServiceRegistry::new(config).unwrap());
    let provider = EgMethodTable::new()
        .with_method("double", |args| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        })
        .with_method("slow", |_| {
            thread::sleep(Duration::from_millis(50));
            Ok(json!("slow"))
        })
        .with_method("fail", |_| Err(EgError::invocation("math", "fail", "refused")))
        .into_handle();
    registry
        .register_service(EgServiceDescriptor::new("math", "1.0.0").with_provider(provider))
        .unwrap();
    registry
}

#[test]
fn test_async_call_resolves_with_value() {
    let calls = EgAsyncServiceCall::new(registry(), 2).unwrap();
    assert_eq!(calls.workers(), 2);
    let future = calls.call_async("math", "double", vec![json!(21)], None);
    assert_eq!(future.wait(Some(Duration::from_secs(5))).unwrap(), json!(42));
    assert!(future.is_finished());
    assert_eq!(future.result(), Some(json!(42)));
}

#[test]
fn test_async_errors_reach_the_future() {
    let calls = EgAsyncServiceCall::new(registry(), 1).unwrap();
    let failed = calls.call_async("math", "fail", Vec::new(), None);
    let missing = calls.call_async("nowhere", "double", Vec::new(), None);

    assert!(matches!(
        failed.wait(Some(Duration::from_secs(5))),
        Err(EgError::Invocation { .. })
    ));
    assert!(matches!(
        missing.wait(Some(Duration::from_secs(5))),
        Err(EgError::NotFound { .. })
    ));
    assert!(failed.error().is_some());
}

#[test]
fn test_calls_run_in_parallel_on_the_pool() {
    let calls = EgAsyncServiceCall::new(registry(), 4).unwrap();
    let started = Instant::now();
    let futures: Vec<EgServiceFuture> = (0..4)
        .map(|_| calls.call_async("math", "slow", Vec::new(), None))
        .collect();
    let results = EgServiceFuture::wait_for_all(&futures, Some(Duration::from_secs(5)));
    assert!(results.iter().all(|r| r.as_ref().map(|v| v == "slow").unwrap_or(false)));
    assert!(started.elapsed() < Duration::from_millis(190));
}

#[test]
fn test_callbacks_fire_from_the_worker() {
    let calls = EgAsyncServiceCall::new(registry(), 1).unwrap();
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let future = calls.call_async("math", "double", vec![json!(5)], None);
    future
        .then(move |value| {
            let _ = tx.send(value.clone());
        })
        .finally(move || {
            let _ = done_tx.send(());
        });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), json!(10));
    assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
}

#[test]
fn test_wait_for_all_shares_one_deadline() {
    let pending = EgServiceFuture::new();
    let ready = EgServiceFuture::ready(Ok(json!(1)));
    let started = Instant::now();
    let results = EgServiceFuture::wait_for_all(
        &[pending.clone(), ready, pending],
        Some(Duration::from_millis(30)),
    );
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(matches!(results[0], Err(EgError::Timeout { .. })));
    assert_eq!(results[1].as_ref().unwrap(), &json!(1));
    assert!(matches!(results[2], Err(EgError::Timeout { .. })));
}

#[test]
fn test_per_call_timeout_applies_inside_the_pool() {
    let calls = EgAsyncServiceCall::new(registry(), 1).unwrap();
    let future = calls.call_async("math", "slow", Vec::new(), Some(Duration::from_millis(5)));
    assert!(matches!(
        future.wait(Some(Duration::from_secs(5))),
        Err(EgError::Timeout { .. })
    ));
}
