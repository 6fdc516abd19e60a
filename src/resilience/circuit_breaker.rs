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

//! # Circuit Breaker
//!
//! Three-state breaker guarding calls to a single service.
//!
//! - **Closed**: calls pass; consecutive failures are counted
//! - **Open**: calls are rejected until `timeout_ms` has passed since the
//!   last failure recorded while closed or half-open
//! - **HalfOpen**: calls pass; `success_threshold` successes close the
//!   breaker, any failure reopens it
//!
//! Transitions are published on the event bus after the breaker lock has
//! been released.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::events::{EgEvent, EgEventBus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgCircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl EgCircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgCircuitState::Closed => "closed",
            EgCircuitState::Open => "open",
            EgCircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds and timers for a breaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgCircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Successes in half-open state that close the breaker.
    pub success_threshold: u32,
    /// Time an open breaker waits before probing.
    pub timeout_ms: u64,
    /// Time a half-open breaker may take to reach the success threshold.
    pub half_open_timeout_ms: u64,
}

impl Default for EgCircuitBreakerConfig {
    fn default() -> Self {
        EgCircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            half_open_timeout_ms: 10_000,
        }
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EgCircuitBreakerStats {
    pub service_name: String,
    pub state: EgCircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub transitions: u64,
}

#[derive(Debug)]
struct EgBreakerState {
    state: EgCircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    half_open_since: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    transitions: u64,
}

impl EgBreakerState {
    fn new() -> Self {
        EgBreakerState {
            state: EgCircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            half_open_since: None,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            transitions: 0,
        }
    }

    fn transition(&mut self, new_state: EgCircuitState) -> Option<(EgCircuitState, EgCircuitState)> {
        let old_state = self.state;
        if old_state == new_state {
            return None;
        }
        self.state = new_state;
        self.transitions += 1;
        match new_state {
            EgCircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.half_open_since = None;
            }
            EgCircuitState::HalfOpen => {
                self.success_count = 0;
                self.half_open_since = Some(Instant::now());
            }
            EgCircuitState::Open => {
                self.success_count = 0;
                self.half_open_since = None;
            }
        }
        Some((old_state, new_state))
    }
}

pub struct EgCircuitBreaker {
    service_name: String,
    config: EgCircuitBreakerConfig,
    inner: Mutex<EgBreakerState>,
    events: Option<Arc<EgEventBus>>,
}

impl std::fmt::Debug for EgCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgCircuitBreaker")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl EgCircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: EgCircuitBreakerConfig) -> Self {
        EgCircuitBreaker {
            service_name: service_name.into(),
            config,
            inner: Mutex::new(EgBreakerState::new()),
            events: None,
        }
    }

    /// Attach the bus that receives `CircuitStateChanged` notifications.
    pub fn with_event_bus(mut self, events: Arc<EgEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn config(&self) -> &EgCircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, EgBreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may proceed. An open breaker whose timeout has elapsed
    /// moves to half-open and admits the call.
    pub fn allow_call(&self) -> bool {
        let (allowed, change) = {
            let mut inner = self.lock();
            let change = self._advance_timers(&mut inner);
            let allowed = inner.state != EgCircuitState::Open;
            if !allowed {
                inner.rejected_calls += 1;
            }
            (allowed, change)
        };
        self._notify(change);
        allowed
    }

    pub fn record_success(&self) {
        let change = {
            let mut inner = self.lock();
            inner.total_successes += 1;
            match inner.state {
                EgCircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                EgCircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.transition(EgCircuitState::Closed)
                    } else {
                        None
                    }
                }
                EgCircuitState::Open => None,
            }
        };
        self._notify(change);
    }

    pub fn record_failure(&self) {
        let change = {
            let mut inner = self.lock();
            inner.total_failures += 1;
            match inner.state {
                EgCircuitState::Closed => {
                    inner.failure_count += 1;
                    inner.last_failure_time = Some(Instant::now());
                    if inner.failure_count >= self.config.failure_threshold {
                        inner.transition(EgCircuitState::Open)
                    } else {
                        None
                    }
                }
                EgCircuitState::HalfOpen => {
                    inner.failure_count += 1;
                    inner.last_failure_time = Some(Instant::now());
                    inner.transition(EgCircuitState::Open)
                }
                // Rejected calls must not postpone recovery.
                EgCircuitState::Open => {
                    inner.failure_count += 1;
                    None
                }
            }
        };
        self._notify(change);
    }

    pub fn state(&self) -> EgCircuitState {
        self.lock().state
    }

    /// Return to Closed with all counters cleared.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.lock();
            let change = inner.transition(EgCircuitState::Closed);
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure_time = None;
            change
        };
        self._notify(change);
    }

    /// Open the breaker immediately, as if the failure threshold had just
    /// been reached.
    pub fn force_open(&self) {
        let change = {
            let mut inner = self.lock();
            inner.last_failure_time = Some(Instant::now());
            inner.transition(EgCircuitState::Open)
        };
        self._notify(change);
    }

    /// Timer callback: applies Open → HalfOpen and HalfOpen → Open timeouts.
    pub fn check_timers(&self) -> EgCircuitState {
        let (state, change) = {
            let mut inner = self.lock();
            let change = self._advance_timers(&mut inner);
            (inner.state, change)
        };
        self._notify(change);
        state
    }

    pub fn stats(&self) -> EgCircuitBreakerStats {
        let inner = self.lock();
        EgCircuitBreakerStats {
            service_name: self.service_name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected_calls: inner.rejected_calls,
            transitions: inner.transitions,
        }
    }

    fn _advance_timers(
        &self,
        inner: &mut EgBreakerState,
    ) -> Option<(EgCircuitState, EgCircuitState)> {
        match inner.state {
            EgCircuitState::Open => {
                let timeout = Duration::from_millis(self.config.timeout_ms);
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed() >= timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.transition(EgCircuitState::HalfOpen)
                } else {
                    None
                }
            }
            EgCircuitState::HalfOpen => {
                let timeout = Duration::from_millis(self.config.half_open_timeout_ms);
                let expired = inner
                    .half_open_since
                    .map(|t| t.elapsed() >= timeout)
                    .unwrap_or(false);
                if expired {
                    inner.last_failure_time = Some(Instant::now());
                    inner.transition(EgCircuitState::Open)
                } else {
                    None
                }
            }
            EgCircuitState::Closed => None,
        }
    }

    fn _notify(&self, change: Option<(EgCircuitState, EgCircuitState)>) {
        let Some((old_state, new_state)) = change else {
            return;
        };
        match new_state {
            EgCircuitState::Open => log::warn!(
                "resilience.circuit.opened: circuit breaker opened - service={}, from={}",
                self.service_name,
                old_state.as_str()
            ),
            _ => log::info!(
                "resilience.circuit.state_changed: circuit breaker state changed - service={}, from={}, to={}",
                self.service_name,
                old_state.as_str(),
                new_state.as_str()
            ),
        }
        if let Some(events) = &self.events {
            events.publish(EgEvent::CircuitStateChanged {
                service: self.service_name.clone(),
                old_state,
                new_state,
            });
        }
    }
}
