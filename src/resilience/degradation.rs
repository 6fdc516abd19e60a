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

//! Degradation policy: decides when a failed call should be answered by a
//! fallback instead of an error. Executing the strategy is the registry's job.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EgError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgDegradationTrigger {
    CircuitBreakerOpen,
    Timeout,
    ErrorRate,
    /// Only through an explicit degraded call.
    Manual,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgDegradationStrategy {
    FallbackService,
    DefaultValue,
    SimplifiedService,
    Disabled,
}

impl EgDegradationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgDegradationStrategy::FallbackService => "fallback_service",
            EgDegradationStrategy::DefaultValue => "default_value",
            EgDegradationStrategy::SimplifiedService => "simplified_service",
            EgDegradationStrategy::Disabled => "disabled",
        }
    }

    /// Whether the strategy re-invokes another service.
    pub fn needs_fallback_service(&self) -> bool {
        matches!(
            self,
            EgDegradationStrategy::FallbackService | EgDegradationStrategy::SimplifiedService
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EgDegradationPolicyConfig {
    pub service_name: String,
    pub trigger: EgDegradationTrigger,
    pub strategy: EgDegradationStrategy,
    #[serde(default)]
    pub fallback_service_name: String,
    /// Method to call on the fallback service; `None` reuses the original.
    #[serde(default)]
    pub fallback_method: Option<String>,
    #[serde(default)]
    pub default_value: Value,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_enabled() -> bool {
    true
}

impl EgDegradationPolicyConfig {
    pub fn new(
        service_name: impl Into<String>,
        trigger: EgDegradationTrigger,
        strategy: EgDegradationStrategy,
    ) -> Self {
        EgDegradationPolicyConfig {
            service_name: service_name.into(),
            trigger,
            strategy,
            fallback_service_name: String::new(),
            fallback_method: None,
            default_value: Value::Null,
            error_rate_threshold: default_error_rate_threshold(),
            enabled: true,
        }
    }

    /// Shorthand for a DefaultValue policy.
    pub fn default_value(
        service_name: impl Into<String>,
        trigger: EgDegradationTrigger,
        value: Value,
    ) -> Self {
        Self::new(service_name, trigger, EgDegradationStrategy::DefaultValue).with_default_value(value)
    }

    /// Shorthand for a FallbackService policy.
    pub fn fallback(
        service_name: impl Into<String>,
        trigger: EgDegradationTrigger,
        fallback_service: impl Into<String>,
    ) -> Self {
        Self::new(service_name, trigger, EgDegradationStrategy::FallbackService)
            .with_fallback_service(fallback_service)
    }

    pub fn with_fallback_service(mut self, name: impl Into<String>) -> Self {
        self.fallback_service_name = name.into();
        self
    }

    pub fn with_fallback_method(mut self, method: impl Into<String>) -> Self {
        self.fallback_method = Some(method.into());
        self
    }

    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = value;
        self
    }

    pub fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(EgError::validation("degradation policy needs a service name"));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(EgError::validation(format!(
                "error_rate_threshold must be within [0, 1], got {}",
                self.error_rate_threshold
            )));
        }
        if self.strategy.needs_fallback_service() {
            if self.fallback_service_name.trim().is_empty() {
                return Err(EgError::validation(format!(
                    "strategy {} for service '{}' needs a fallback service",
                    self.strategy.as_str(),
                    self.service_name
                )));
            }
            if self.fallback_service_name == self.service_name {
                return Err(EgError::validation(format!(
                    "service '{}' cannot fall back to itself",
                    self.service_name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EgDegradationPolicy {
    policies: RwLock<HashMap<String, EgDegradationPolicyConfig>>,
}

impl EgDegradationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, config: EgDegradationPolicyConfig) -> Result<()> {
        config.validate()?;
        log::debug!(
            "resilience.degradation.policy_set: degradation policy configured - service={}, trigger={:?}, strategy={}",
            config.service_name,
            config.trigger,
            config.strategy.as_str()
        );
        self.policies
            .write()
            .map_err(|_| EgError::internal("degradation policy lock poisoned"))?
            .insert(config.service_name.clone(), config);
        Ok(())
    }

    pub fn remove_policy(&self, service: &str) -> bool {
        self.policies
            .write()
            .map(|mut p| p.remove(service).is_some())
            .unwrap_or(false)
    }

    pub fn degradation_strategy(&self, service: &str) -> Option<EgDegradationPolicyConfig> {
        self.policies.read().ok()?.get(service).cloned()
    }

    /// Whether `service` should degrade for the observed trigger. `error_rate`
    /// is only consulted for the ErrorRate trigger.
    pub fn should_degrade(
        &self,
        service: &str,
        trigger: EgDegradationTrigger,
        error_rate: f64,
    ) -> bool {
        let Some(policy) = self.degradation_strategy(service) else {
            return false;
        };
        if !policy.enabled {
            return false;
        }
        match policy.trigger {
            EgDegradationTrigger::Always => true,
            EgDegradationTrigger::Manual => false,
            EgDegradationTrigger::ErrorRate => {
                trigger == EgDegradationTrigger::ErrorRate
                    && error_rate >= policy.error_rate_threshold
            }
            configured => configured == trigger,
        }
    }
}
