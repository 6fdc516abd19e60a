//! Copyright © 2025-2026 Wenze Wei. All Rights Reserved.
//!
//! This file is part of Eagle.
//! The Eagle project belongs to the Dunimd project team.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use eagle::events::{EgEvent, EgEventBus};
use eagle::resilience::*;
use proptest::prelude::*;
use serde_json::json;

fn fast_breaker(failures: u32, successes: u32) -> EgCircuitBreaker {
    EgCircuitBreaker::new(
        "billing",
        EgCircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            timeout_ms: 40,
            half_open_timeout_ms: 1_000,
        },
    )
}

#[test]
fn test_breaker_opens_exactly_at_threshold() {
    let breaker = fast_breaker(3, 1);
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), EgCircuitState::Closed);
    assert!(breaker.allow_call());
    breaker.record_failure();
    assert_eq!(breaker.state(), EgCircuitState::Open);
    assert!(!breaker.allow_call());
}

#[test]
fn test_breaker_counts_every_failure_from_many_threads() {
    const THREADS: usize = 8;
    const CALLS: usize = 250;
    let breaker = Arc::new(EgCircuitBreaker::new(
        "billing",
        EgCircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            timeout_ms: 60_000,
            half_open_timeout_ms: 60_000,
        },
    ));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            thread::spawn(move || {
                for _ in 0..CALLS {
                    breaker.allow_call();
                    breaker.record_failure();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.state, EgCircuitState::Open);
    assert_eq!(stats.total_failures, (THREADS * CALLS) as u64);
    assert_eq!(stats.transitions, 1);
    assert!(!breaker.allow_call());
}

#[test]
fn test_breaker_totals_add_up_under_mixed_outcomes() {
    let breaker = Arc::new(EgCircuitBreaker::new(
        "billing",
        EgCircuitBreakerConfig {
            failure_threshold: u32::MAX,
            success_threshold: 1,
            timeout_ms: 60_000,
            half_open_timeout_ms: 60_000,
        },
    ));
    let workers: Vec<_> = (0..6)
        .map(|i| {
            let breaker = Arc::clone(&breaker);
            thread::spawn(move || {
                for _ in 0..200 {
                    if i % 2 == 0 {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = breaker.stats();
    assert_eq!(stats.state, EgCircuitState::Closed);
    assert_eq!(stats.total_successes, 600);
    assert_eq!(stats.total_failures, 600);
}

#[test]
fn test_breaker_success_resets_consecutive_failures() {
    let breaker = fast_breaker(3, 1);
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), EgCircuitState::Closed);
}

#[test]
fn test_breaker_half_opens_after_timeout_and_closes() {
    let breaker = fast_breaker(1, 2);
    breaker.record_failure();
    assert!(!breaker.allow_call());

    thread::sleep(Duration::from_millis(60));
    assert!(breaker.allow_call());
    assert_eq!(breaker.state(), EgCircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), EgCircuitState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), EgCircuitState::Closed);
    assert_eq!(breaker.stats().failure_count, 0);
}

#[test]
fn test_breaker_half_open_failure_reopens() {
    let breaker = fast_breaker(1, 2);
    breaker.record_failure();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(breaker.check_timers(), EgCircuitState::HalfOpen);
    breaker.record_failure();
    assert_eq!(breaker.state(), EgCircuitState::Open);
}

#[test]
fn test_rejected_calls_do_not_postpone_recovery() {
    let breaker = fast_breaker(1, 1);
    breaker.record_failure();
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(10));
        if breaker.allow_call() {
            break;
        }
        breaker.record_failure();
    }
    thread::sleep(Duration::from_millis(40));
    assert!(breaker.allow_call());
}

#[test]
fn test_breaker_transitions_are_published() {
    let events = Arc::new(EgEventBus::new());
    let seen: Arc<Mutex<Vec<(EgCircuitState, EgCircuitState)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    events.subscribe(move |event| {
        if let EgEvent::CircuitStateChanged {
            old_state, new_state, ..
        } = event
        {
            sink.lock().unwrap().push((*old_state, *new_state));
        }
    });

    let breaker = fast_breaker(1, 1).with_event_bus(Arc::clone(&events));
    breaker.record_failure();
    breaker.reset();
    events.dispatch_pending();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EgCircuitState::Closed, EgCircuitState::Open),
            (EgCircuitState::Open, EgCircuitState::Closed),
        ]
    );
}

#[test]
fn test_retry_strategies_and_clamp() {
    let base = EgRetryPolicyConfig {
        max_retries: 5,
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
        ..Default::default()
    };
    let fixed = EgRetryPolicyConfig {
        strategy: EgRetryStrategy::Fixed,
        ..base.clone()
    };
    let linear = EgRetryPolicyConfig {
        strategy: EgRetryStrategy::Linear,
        ..base.clone()
    };
    let exponential = EgRetryPolicyConfig {
        strategy: EgRetryStrategy::Exponential,
        ..base
    };

    assert_eq!(fixed.delay_for(3), Duration::from_millis(100));
    assert_eq!(linear.delay_for(2), Duration::from_millis(300));
    assert_eq!(exponential.delay_for(0), Duration::from_millis(100));
    assert_eq!(exponential.delay_for(2), Duration::from_millis(400));
    assert_eq!(exponential.delay_for(10), Duration::from_millis(1_000));
}

#[test]
fn test_retryability_lists() {
    let policy = EgRetryPolicy::new();
    policy
        .set_policy(
            "payments",
            EgRetryPolicyConfig {
                max_retries: 2,
                retryable_errors: vec!["timeout".into(), "unavailable".into()],
                non_retryable_errors: vec!["forbidden".into()],
                ..Default::default()
            },
        )
        .unwrap();

    assert!(policy.should_retry("payments", 0, "Upstream TIMEOUT"));
    assert!(!policy.should_retry("payments", 0, "disk full"));
    assert!(!policy.should_retry("payments", 0, "timeout: forbidden"));
    assert!(!policy.should_retry("payments", 2, "timeout"));
    assert!(policy.should_retry("other", 0, "anything"));
}

#[test]
fn test_invalid_retry_config_is_rejected() {
    let policy = EgRetryPolicy::new();
    let bad = EgRetryPolicyConfig {
        initial_delay_ms: 500,
        max_delay_ms: 100,
        ..Default::default()
    };
    assert!(policy.set_policy("svc", bad).is_err());
    let bad = EgRetryPolicyConfig {
        backoff_multiplier: 0.0,
        ..Default::default()
    };
    assert!(policy.set_policy("svc", bad).is_err());
}

#[test]
fn test_degradation_trigger_matching() {
    let policy = EgDegradationPolicy::new();
    policy
        .set_policy(EgDegradationPolicyConfig::default_value(
            "search",
            EgDegradationTrigger::Timeout,
            json!([]),
        ))
        .unwrap();
    policy
        .set_policy(
            EgDegradationPolicyConfig::default_value("rank", EgDegradationTrigger::ErrorRate, json!(0))
                .with_error_rate_threshold(0.3),
        )
        .unwrap();
    policy
        .set_policy(EgDegradationPolicyConfig::default_value(
            "manual",
            EgDegradationTrigger::Manual,
            json!(null),
        ))
        .unwrap();

    assert!(policy.should_degrade("search", EgDegradationTrigger::Timeout, 0.0));
    assert!(!policy.should_degrade("search", EgDegradationTrigger::CircuitBreakerOpen, 1.0));
    assert!(policy.should_degrade("rank", EgDegradationTrigger::ErrorRate, 0.3));
    assert!(!policy.should_degrade("rank", EgDegradationTrigger::ErrorRate, 0.1));
    assert!(!policy.should_degrade("manual", EgDegradationTrigger::Manual, 1.0));
    assert!(!policy.should_degrade("unknown", EgDegradationTrigger::Always, 1.0));
}

#[test]
fn test_fallback_policy_must_name_another_service() {
    let policy = EgDegradationPolicy::new();
    let missing = EgDegradationPolicyConfig::new(
        "search",
        EgDegradationTrigger::Always,
        EgDegradationStrategy::FallbackService,
    );
    assert!(policy.set_policy(missing).is_err());
    let itself = EgDegradationPolicyConfig::fallback("search", EgDegradationTrigger::Always, "search");
    assert!(policy.set_policy(itself).is_err());
    let ok = EgDegradationPolicyConfig::fallback("search", EgDegradationTrigger::Always, "search-lite");
    assert!(policy.set_policy(ok).is_ok());
}

fn arb_retry_config() -> impl Strategy<Value = EgRetryPolicyConfig> {
    (0u64..=200u64, 1u64..=10_000u64, 1.0f64..=4.0f64).prop_map(|(initial, max, multiplier)| {
        EgRetryPolicyConfig {
            max_retries: 10,
            initial_delay_ms: initial,
            max_delay_ms: max.max(initial),
            backoff_multiplier: multiplier,
            strategy: EgRetryStrategy::Exponential,
            ..Default::default()
        }
    })
}

proptest! {
    #[test]
    fn prop_exponential_delay_non_decreasing(config in arb_retry_config()) {
        let mut previous = Duration::ZERO;
        for attempt in 0..12u32 {
            let delay = config.delay_for(attempt);
            prop_assert!(delay >= previous, "attempt {} went from {:?} to {:?}", attempt, previous, delay);
            prop_assert!(delay <= Duration::from_millis(config.max_delay_ms));
            previous = delay;
        }
    }

    #[test]
    fn prop_should_retry_respects_max_retries(max_retries in 0u32..8u32, attempt in 0u32..16u32) {
        let policy = EgRetryPolicy::with_default(EgRetryPolicyConfig {
            max_retries,
            ..Default::default()
        })
        .unwrap();
        prop_assert_eq!(policy.should_retry("svc", attempt, "boom"), attempt < max_retries);
    }
}
