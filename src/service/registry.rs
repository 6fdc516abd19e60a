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

//! # Eagle Service Registry
//!
//! Registers service providers and executes calls through the resilience
//! pipeline.
//!
//! ## Call Pipeline
//!
//! Each attempt runs, in order:
//!
//! 1. circuit breaker admission
//! 2. provider selection (load balancer, or direct lookup)
//! 3. method resolution on the provider
//! 4. invocation under a wall-clock timer, with panics caught
//!
//! A failed attempt is retried while the retry policy allows it, sleeping on
//! the calling thread between attempts. Once retries are exhausted the
//! degradation policy may answer instead; otherwise the error is returned and
//! a `ServiceCallFailed` event is published.
//!
//! No registry lock is held while a provider runs or while a fallback service
//! is called.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{duration_millis, panic_message, EgError, Result};
use crate::events::{EgEvent, EgEventBus};
use crate::monitor::EgPerformanceMonitor;
use crate::resilience::circuit_breaker::{EgCircuitBreaker, EgCircuitBreakerConfig, EgCircuitState};
use crate::resilience::degradation::{
    EgDegradationPolicy, EgDegradationPolicyConfig, EgDegradationStrategy, EgDegradationTrigger,
};
use crate::resilience::load_balancer::{EgLoadBalancer, EgLoadBalancingAlgorithm, EgServiceInstance};
use crate::resilience::retry::{EgRetryPolicy, EgRetryPolicyConfig};
use crate::service::descriptor::{provider_address, EgProviderHandle, EgServiceDescriptor};

/// Registry settings. Also the `services` section of the framework config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgRegistryConfig {
    pub circuit_breaker_enabled: bool,
    pub load_balancing_enabled: bool,
    pub retry_enabled: bool,
    pub degradation_enabled: bool,
    /// Per-attempt timeout used when a call does not pass one. 0 disables it.
    pub default_timeout_ms: u64,
    pub circuit_breaker: EgCircuitBreakerConfig,
    pub retry: EgRetryPolicyConfig,
    pub default_algorithm: EgLoadBalancingAlgorithm,
    /// Async worker pool size; 0 uses the number of CPUs.
    pub worker_threads: usize,
    pub maintenance_interval_ms: u64,
}

impl Default for EgRegistryConfig {
    fn default() -> Self {
        EgRegistryConfig {
            circuit_breaker_enabled: true,
            load_balancing_enabled: true,
            retry_enabled: true,
            degradation_enabled: true,
            default_timeout_ms: 30_000,
            circuit_breaker: EgCircuitBreakerConfig::default(),
            retry: EgRetryPolicyConfig::default(),
            default_algorithm: EgLoadBalancingAlgorithm::RoundRobin,
            worker_threads: 0,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl EgRegistryConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return Err(EgError::validation(
                "circuit breaker thresholds must be at least 1",
            ));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(EgError::validation("maintenance_interval_ms must be positive"));
        }
        Ok(())
    }
}

/// Per-service call counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EgServiceStats {
    pub calls: u64,
    pub failed_calls: u64,
    pub degraded_calls: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub total_latency_micros: u128,
}

impl EgServiceStats {
    /// Share of failed attempts, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.failed_attempts as f64 / self.attempts as f64
    }
}

struct EgAttemptFailure {
    error: EgError,
    trigger: EgDegradationTrigger,
}

impl EgAttemptFailure {
    fn new(error: EgError, trigger: EgDegradationTrigger) -> Self {
        EgAttemptFailure { error, trigger }
    }
}

/// Parameters shared by every attempt of one call.
struct EgCallRequest<'a> {
    service: &'a str,
    method: &'a str,
    args: &'a [Value],
    timeout: Option<Duration>,
    client_id: Option<&'a str>,
}

pub struct EgServiceRegistry {
    config: RwLock<EgRegistryConfig>,
    services: RwLock<HashMap<String, Vec<EgServiceDescriptor>>>,
    breakers: Mutex<HashMap<String, Arc<EgCircuitBreaker>>>,
    stats: Mutex<HashMap<String, EgServiceStats>>,
    retry: EgRetryPolicy,
    degradation: EgDegradationPolicy,
    balancer: EgLoadBalancer,
    events: Arc<EgEventBus>,
    monitor: RwLock<Option<Arc<dyn EgPerformanceMonitor>>>,
    maintenance_running: Arc<AtomicBool>,
}

impl std::fmt::Debug for EgServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgServiceRegistry")
            .field("services", &self.services())
            .field("config", &self.config())
            .finish()
    }
}

impl EgServiceRegistry {
    pub fn new(config: EgRegistryConfig) -> Result<Self> {
        Self::with_event_bus(config, Arc::new(EgEventBus::new()))
    }

    pub fn with_event_bus(config: EgRegistryConfig, events: Arc<EgEventBus>) -> Result<Self> {
        config.validate()?;
        let retry = EgRetryPolicy::with_default(config.retry.clone())?;
        let balancer = EgLoadBalancer::new().with_event_bus(Arc::clone(&events));
        balancer.set_default_algorithm(config.default_algorithm);
        Ok(EgServiceRegistry {
            config: RwLock::new(config),
            services: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            retry,
            degradation: EgDegradationPolicy::new(),
            balancer,
            events,
            monitor: RwLock::new(None),
            maintenance_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_performance_monitor(&self, monitor: Arc<dyn EgPerformanceMonitor>) {
        if let Ok(mut guard) = self.monitor.write() {
            *guard = Some(monitor);
        }
    }

    pub fn config(&self) -> EgRegistryConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn _update_config(&self, update: impl FnOnce(&mut EgRegistryConfig)) {
        if let Ok(mut config) = self.config.write() {
            update(&mut config);
        }
    }

    pub fn set_circuit_breaker_enabled(&self, enabled: bool) {
        self._update_config(|c| c.circuit_breaker_enabled = enabled);
    }

    pub fn set_load_balancing_enabled(&self, enabled: bool) {
        self._update_config(|c| c.load_balancing_enabled = enabled);
    }

    pub fn set_retry_enabled(&self, enabled: bool) {
        self._update_config(|c| c.retry_enabled = enabled);
    }

    pub fn set_degradation_enabled(&self, enabled: bool) {
        self._update_config(|c| c.degradation_enabled = enabled);
    }

    pub fn event_bus(&self) -> &Arc<EgEventBus> {
        &self.events
    }

    pub fn retry_policy(&self) -> &EgRetryPolicy {
        &self.retry
    }

    pub fn degradation_policy(&self) -> &EgDegradationPolicy {
        &self.degradation
    }

    pub fn load_balancer(&self) -> &EgLoadBalancer {
        &self.balancer
    }

    // Registration

    /// Register a provider under `service_name@version`. Another provider for
    /// the same key becomes an additional load-balanced instance; the same
    /// provider again replaces its earlier descriptor.
    pub fn register_service(&self, mut descriptor: EgServiceDescriptor) -> Result<String> {
        descriptor.normalize()?;
        let key = descriptor.key();
        let address = descriptor.provider.as_ref().map(provider_address);
        {
            let mut services = self
                .services
                .write()
                .map_err(|_| EgError::internal("service table lock poisoned"))?;
            let entries = services.entry(descriptor.service_name.clone()).or_default();
            entries.retain(|d| !(d.version == descriptor.version && d.provider.as_ref().map(provider_address) == address));
            entries.push(descriptor.clone());
        }
        if self.config().load_balancing_enabled {
            let service = descriptor.service_name.clone();
            self.balancer.register_instance(&service, descriptor.clone(), 1)?;
        }
        log::info!(
            "service.registry.registered: service registered - service={}, methods={}",
            key,
            descriptor.methods.len()
        );
        self.events.publish(EgEvent::ServiceRegistered {
            service: descriptor.service_name,
            version: descriptor.version,
        });
        Ok(key)
    }

    /// Remove every provider of `name`, or only those of `version`. Returns
    /// the number of descriptors removed.
    pub fn unregister_service(&self, name: &str, version: Option<&str>) -> usize {
        let removed: Vec<EgServiceDescriptor> = match self.services.write() {
            Ok(mut services) => {
                let Some(entries) = services.get_mut(name) else {
                    return 0;
                };
                let (gone, kept): (Vec<_>, Vec<_>) = entries
                    .drain(..)
                    .partition(|d| version.map(|v| d.version == v).unwrap_or(true));
                *entries = kept;
                if entries.is_empty() {
                    services.remove(name);
                }
                gone
            }
            Err(_) => return 0,
        };
        self._forget(&removed);
        removed.len()
    }

    /// Remove every descriptor backed by `provider`, across all services.
    pub fn unregister_provider(&self, provider: &EgProviderHandle) -> usize {
        let address = provider_address(provider);
        let removed: Vec<EgServiceDescriptor> = match self.services.write() {
            Ok(mut services) => {
                let mut gone = Vec::new();
                for entries in services.values_mut() {
                    let (matched, kept): (Vec<_>, Vec<_>) = entries
                        .drain(..)
                        .partition(|d| d.provider.as_ref().map(provider_address) == Some(address));
                    *entries = kept;
                    gone.extend(matched);
                }
                services.retain(|_, entries| !entries.is_empty());
                gone
            }
            Err(_) => return 0,
        };
        self._forget(&removed);
        removed.len()
    }

    fn _forget(&self, removed: &[EgServiceDescriptor]) {
        for descriptor in removed {
            if let Some(instance_id) = EgLoadBalancer::instance_id_of(descriptor) {
                self.balancer
                    .unregister_instance(&descriptor.service_name, &instance_id);
            }
            log::info!(
                "service.registry.unregistered: service unregistered - service={}",
                descriptor.key()
            );
            self.events.publish(EgEvent::ServiceUnregistered {
                service: descriptor.service_name.clone(),
                version: descriptor.version.clone(),
            });
        }
    }

    /// Latest registered descriptor of `name`, optionally for one version.
    pub fn find_service(&self, name: &str, version: Option<&str>) -> Option<EgServiceDescriptor> {
        let services = self.services.read().ok()?;
        let entries = services.get(name)?;
        match version {
            Some(v) => entries.iter().rev().find(|d| d.version == v).cloned(),
            None => entries.last().cloned(),
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services
            .read()
            .map(|s| s.contains_key(name))
            .unwrap_or(false)
    }

    // Resilience accessors

    /// Breaker for `service`, created on first use.
    pub fn circuit_breaker(&self, service: &str) -> Arc<EgCircuitBreaker> {
        let config = self.config().circuit_breaker;
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(
                EgCircuitBreaker::new(service, config).with_event_bus(Arc::clone(&self.events)),
            )
        }))
    }

    pub fn reset_circuit_breaker(&self, service: &str) -> bool {
        let breaker = self
            .breakers
            .lock()
            .ok()
            .and_then(|b| b.get(service).cloned());
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn set_retry_policy(&self, service: &str, config: EgRetryPolicyConfig) -> Result<()> {
        self.retry.set_policy(service, config)
    }

    pub fn set_degradation_policy(&self, config: EgDegradationPolicyConfig) -> Result<()> {
        self.degradation.set_policy(config)
    }

    pub fn set_load_balancing_algorithm(&self, service: &str, algorithm: EgLoadBalancingAlgorithm) -> bool {
        self.balancer.set_algorithm(service, algorithm)
    }

    pub fn set_instance_weight(&self, service: &str, instance_id: &str, weight: u32) -> bool {
        self.balancer.set_instance_weight(service, instance_id, weight)
    }

    pub fn set_instance_health(&self, service: &str, instance_id: &str, healthy: bool) -> bool {
        self.balancer.set_instance_health(service, instance_id, healthy)
    }

    pub fn service_instances(&self, service: &str) -> Vec<EgServiceInstance> {
        self.balancer.instances(service)
    }

    pub fn service_stats(&self, service: &str) -> EgServiceStats {
        self.stats
            .lock()
            .ok()
            .and_then(|s| s.get(service).cloned())
            .unwrap_or_default()
    }

    fn _with_stats(&self, service: &str, update: impl FnOnce(&mut EgServiceStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(stats.entry(service.to_string()).or_default());
        }
    }

    // Calls

    /// Call `service::method`. `timeout` of `None` uses the configured
    /// default.
    pub fn call_service(
        &self,
        service: &str,
        method: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.call_service_with_client(service, method, args, timeout, None)
    }

    /// Same as [`call_service`](Self::call_service) with a client id for
    /// IPHash affinity.
    pub fn call_service_with_client(
        &self,
        service: &str,
        method: &str,
        args: &[Value],
        timeout: Option<Duration>,
        client_id: Option<&str>,
    ) -> Result<Value> {
        let timeout = timeout.or_else(|| {
            let ms = self.config().default_timeout_ms;
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        let request = EgCallRequest {
            service,
            method,
            args,
            timeout,
            client_id,
        };
        let mut chain = Vec::new();
        self._call(&request, &mut chain)
    }

    /// Answer a call with the service's degradation strategy directly. This is
    /// the only way a `Manual` policy takes effect.
    pub fn call_degraded(&self, service: &str, method: &str, args: &[Value]) -> Result<Value> {
        let policy = self
            .degradation
            .degradation_strategy(service)
            .filter(|p| p.enabled)
            .ok_or_else(|| EgError::not_found("degradation policy", service))?;
        let request = EgCallRequest {
            service,
            method,
            args,
            timeout: None,
            client_id: None,
        };
        let mut chain = vec![service.to_string()];
        self._execute_degradation(&policy, &request, &mut chain)
    }

    fn _call(&self, request: &EgCallRequest<'_>, chain: &mut Vec<String>) -> Result<Value> {
        let service = request.service;
        if chain.iter().any(|s| s == service) {
            let path = format!("{} -> {}", chain.join(" -> "), service);
            log::error!(
                "service.call.recursion: fallback chain revisits a service - chain={}",
                path
            );
            return Err(EgError::validation(format!(
                "degradation chain revisits service '{}': {}",
                service, path
            )));
        }
        if !self.has_service(service) {
            let err = EgError::not_found("service", service);
            self._publish_failure(request, &err, 0);
            return Err(err);
        }

        chain.push(service.to_string());
        let result = self._call_with_retries(request, chain);
        chain.pop();
        result
    }

    fn _call_with_retries(&self, request: &EgCallRequest<'_>, chain: &mut Vec<String>) -> Result<Value> {
        let service = request.service;
        let config = self.config();
        let mut retries: u32 = 0;
        loop {
            let failure = match self._attempt(request, &config) {
                Ok(value) => {
                    self._with_stats(service, |s| s.calls += 1);
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let message = failure.error.to_string();
            if config.retry_enabled && self.retry.should_retry(service, retries, &message) {
                let delay = self.retry.retry_delay(service, retries);
                retries += 1;
                log::debug!(
                    "service.call.retry: retrying failed call - service={}, method={}, retry={}, delay_ms={}, error={}",
                    service,
                    request.method,
                    retries,
                    delay.as_millis(),
                    message
                );
                self._with_stats(service, |s| s.retries += 1);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                continue;
            }

            let attempts = retries + 1;
            if config.degradation_enabled {
                if let Some(policy) = self._degradation_for(service, failure.trigger) {
                    return self._execute_degradation(&policy, request, chain);
                }
            }

            log::warn!(
                "service.call.failed: service call failed - service={}, method={}, attempts={}, error={}",
                service,
                request.method,
                attempts,
                message
            );
            self._with_stats(service, |s| {
                s.calls += 1;
                s.failed_calls += 1;
            });
            self._publish_failure(request, &failure.error, attempts);
            return Err(failure.error);
        }
    }

    fn _degradation_for(
        &self,
        service: &str,
        trigger: EgDegradationTrigger,
    ) -> Option<EgDegradationPolicyConfig> {
        let error_rate = self.service_stats(service).error_rate();
        let degrade = self.degradation.should_degrade(service, trigger, error_rate)
            || (trigger != EgDegradationTrigger::ErrorRate
                && self
                    .degradation
                    .should_degrade(service, EgDegradationTrigger::ErrorRate, error_rate));
        if degrade {
            self.degradation.degradation_strategy(service)
        } else {
            None
        }
    }

    fn _execute_degradation(
        &self,
        policy: &EgDegradationPolicyConfig,
        request: &EgCallRequest<'_>,
        chain: &mut Vec<String>,
    ) -> Result<Value> {
        let service = request.service;
        log::info!(
            "service.call.degraded: answering with degradation strategy - service={}, method={}, strategy={}",
            service,
            request.method,
            policy.strategy.as_str()
        );
        self._with_stats(service, |s| {
            s.calls += 1;
            s.degraded_calls += 1;
        });
        self.events.publish(EgEvent::ServiceDegraded {
            service: service.to_string(),
            method: request.method.to_string(),
            strategy: policy.strategy.as_str().to_string(),
        });
        match policy.strategy {
            EgDegradationStrategy::DefaultValue => Ok(policy.default_value.clone()),
            EgDegradationStrategy::Disabled => Ok(Value::Null),
            EgDegradationStrategy::FallbackService | EgDegradationStrategy::SimplifiedService => {
                let method = policy.fallback_method.as_deref().unwrap_or(request.method);
                let fallback = EgCallRequest {
                    service: &policy.fallback_service_name,
                    method,
                    args: request.args,
                    timeout: request.timeout,
                    client_id: request.client_id,
                };
                self._call(&fallback, chain)
            }
        }
    }

    fn _attempt(
        &self,
        request: &EgCallRequest<'_>,
        config: &EgRegistryConfig,
    ) -> std::result::Result<Value, EgAttemptFailure> {
        let service = request.service;
        let method = request.method;

        let breaker = config
            .circuit_breaker_enabled
            .then(|| self.circuit_breaker(service));
        if let Some(breaker) = &breaker {
            if !breaker.allow_call() {
                breaker.record_failure();
                self._with_stats(service, |s| {
                    s.attempts += 1;
                    s.failed_attempts += 1;
                });
                return Err(EgAttemptFailure::new(
                    EgError::circuit_open(service),
                    EgDegradationTrigger::CircuitBreakerOpen,
                ));
            }
        }

        let outcome = self._invoke(request, config);
        let failed = outcome.is_err();
        if let Some(breaker) = &breaker {
            if failed {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
        }
        self._with_stats(service, |s| {
            s.attempts += 1;
            if failed {
                s.failed_attempts += 1;
            }
        });
        if let Err(failure) = &outcome {
            log::debug!(
                "service.call.attempt_failed: attempt failed - service={}, method={}, error={}",
                service,
                method,
                failure.error
            );
        }
        outcome
    }

    fn _invoke(
        &self,
        request: &EgCallRequest<'_>,
        config: &EgRegistryConfig,
    ) -> std::result::Result<Value, EgAttemptFailure> {
        let service = request.service;
        let method = request.method;

        let instance = if config.load_balancing_enabled && self.balancer.has_instances(service) {
            match self.balancer.select_instance(service, request.client_id) {
                Some(instance) => Some(instance),
                None => {
                    return Err(EgAttemptFailure::new(
                        EgError::not_found("healthy instance of service", service),
                        EgDegradationTrigger::ErrorRate,
                    ))
                }
            }
        } else {
            None
        };
        let provider = match &instance {
            Some(instance) => instance.descriptor.provider.clone(),
            None => self.find_service(service, None).and_then(|d| d.provider),
        };
        let Some(provider) = provider else {
            return Err(EgAttemptFailure::new(
                EgError::not_found("provider for service", service),
                EgDegradationTrigger::ErrorRate,
            ));
        };

        if !provider.has_method(method) {
            return Err(EgAttemptFailure::new(
                EgError::not_found("method", format!("{}::{}", service, method)),
                EgDegradationTrigger::ErrorRate,
            ));
        }

        if let Some(instance) = &instance {
            self.balancer
                .on_service_call_start(service, &instance.instance_id);
        }
        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| provider.invoke(method, request.args)));
        let elapsed = started.elapsed();
        if let Some(instance) = &instance {
            self.balancer.on_service_call_end(service, &instance.instance_id);
        }

        self._with_stats(service, |s| s.total_latency_micros += elapsed.as_micros());
        let outcome = match result {
            Err(payload) => Err(EgAttemptFailure::new(
                EgError::invocation(service, method, format!("provider panicked: {}", panic_message(payload.as_ref()))),
                EgDegradationTrigger::ErrorRate,
            )),
            Ok(Err(err)) => Err(EgAttemptFailure::new(err, EgDegradationTrigger::ErrorRate)),
            Ok(Ok(_)) if request.timeout.map(|t| elapsed > t).unwrap_or(false) => {
                let timeout_ms = request.timeout.map(duration_millis).unwrap_or(0);
                Err(EgAttemptFailure::new(
                    EgError::timeout(service, method, duration_millis(elapsed), timeout_ms),
                    EgDegradationTrigger::Timeout,
                ))
            }
            Ok(Ok(value)) => Ok(value),
        };

        if let Ok(guard) = self.monitor.read() {
            if let Some(monitor) = guard.as_ref() {
                monitor.record_service_call(service, method, elapsed, outcome.is_ok());
            }
        }
        outcome
    }

    fn _publish_failure(&self, request: &EgCallRequest<'_>, error: &EgError, attempts: u32) {
        self.events.publish(EgEvent::ServiceCallFailed {
            service: request.service.to_string(),
            method: request.method.to_string(),
            error: error.to_string(),
            attempts,
        });
    }

    // Health

    /// False if the service is unknown, has no provider, its breaker is
    /// open, or no load-balanced instance is healthy.
    pub fn check_service_health(&self, service: &str) -> bool {
        match self.find_service(service, None) {
            Some(descriptor) if descriptor.provider.is_some() => {}
            _ => return false,
        }
        let config = self.config();
        if config.circuit_breaker_enabled {
            let breaker = self
                .breakers
                .lock()
                .ok()
                .and_then(|b| b.get(service).cloned());
            if let Some(breaker) = breaker {
                if breaker.state() == EgCircuitState::Open {
                    return false;
                }
            }
        }
        if config.load_balancing_enabled
            && self.balancer.has_instances(service)
            && self.balancer.healthy_instance_count(service) == 0
        {
            return false;
        }
        true
    }

    /// Invoke the `health_check_path` method of every load-balanced instance
    /// that declares one and update its health flag. A result of `false` or
    /// an error marks the instance unhealthy. Returns the number of instances
    /// checked.
    pub fn run_health_checks(&self) -> usize {
        let mut checked = 0;
        for service in self.balancer.services() {
            for instance in self.balancer.instances(&service) {
                let path = instance.descriptor.health_check_path.as_str();
                if path.is_empty() {
                    continue;
                }
                let Some(provider) = instance.descriptor.provider.clone() else {
                    continue;
                };
                let healthy = match catch_unwind(AssertUnwindSafe(|| provider.invoke(path, &[]))) {
                    Ok(Ok(Value::Bool(flag))) => flag,
                    Ok(Ok(_)) => true,
                    Ok(Err(err)) => {
                        log::warn!(
                            "service.health.check_failed: health check returned an error - service={}, instance={}, error={}",
                            service,
                            instance.instance_id,
                            err
                        );
                        false
                    }
                    Err(payload) => {
                        log::error!(
                            "service.health.check_panicked: health check panicked - service={}, instance={}, panic={}",
                            service,
                            instance.instance_id,
                            panic_message(payload.as_ref())
                        );
                        false
                    }
                };
                self.balancer
                    .set_instance_health(&service, &instance.instance_id, healthy);
                checked += 1;
            }
        }
        checked
    }

    /// One maintenance pass: breaker timers, then health checks.
    pub fn run_maintenance(&self) {
        let breakers: Vec<Arc<EgCircuitBreaker>> = self
            .breakers
            .lock()
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default();
        for breaker in breakers {
            breaker.check_timers();
        }
        self.run_health_checks();
    }

    /// Start the background maintenance thread. The thread holds only a weak
    /// reference and exits when the registry is dropped or
    /// [`stop_maintenance`](Self::stop_maintenance) is called.
    pub fn start_maintenance(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if self.maintenance_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let running = Arc::clone(&self.maintenance_running);
        let spawned = thread::Builder::new()
            .name("eagle-maintenance".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    match weak.upgrade() {
                        Some(registry) => registry.run_maintenance(),
                        None => break,
                    }
                }
                log::debug!("service.registry.maintenance_stopped: maintenance thread exited");
            });
        if let Err(e) = spawned {
            self.maintenance_running.store(false, Ordering::SeqCst);
            return Err(EgError::internal(format!("failed to spawn maintenance thread: {}", e)));
        }
        log::info!(
            "service.registry.maintenance_started: maintenance thread started - interval_ms={}",
            interval.as_millis()
        );
        Ok(())
    }

    pub fn stop_maintenance(&self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance_running.load(Ordering::SeqCst)
    }
}

impl Drop for EgServiceRegistry {
    fn drop(&mut self) {
        self.maintenance_running.store(false, Ordering::SeqCst);
    }
}
