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

//! # Retry Policy
//!
//! Per-key retry decisions and backoff delays. Keys are service names; keys
//! without an explicit policy use the global default.
//!
//! Delay for retry `attempt` (zero-based):
//!
//! - Fixed: `initial_delay_ms`
//! - Exponential: `initial_delay_ms * backoff_multiplier^attempt`
//! - Linear: `initial_delay_ms * (1 + attempt)`
//!
//! All results are clamped to `max_delay_ms`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{EgError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgRetryStrategy {
    Fixed,
    Exponential,
    Linear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgRetryPolicyConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub strategy: EgRetryStrategy,
    /// When non-empty, only errors matching one of these fragments retry.
    pub retryable_errors: Vec<String>,
    /// Errors matching any of these fragments never retry.
    pub non_retryable_errors: Vec<String>,
}

impl Default for EgRetryPolicyConfig {
    fn default() -> Self {
        EgRetryPolicyConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            strategy: EgRetryStrategy::Exponential,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl EgRetryPolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(EgError::validation(format!(
                "max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.backoff_multiplier <= 0.0 || !self.backoff_multiplier.is_finite() {
            return Err(EgError::validation(format!(
                "backoff_multiplier must be a positive number, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Whether `error` is retryable under this config's error lists.
    pub fn is_retryable(&self, error: &str) -> bool {
        let error = error.to_lowercase();
        let matches = |fragment: &String| error.contains(&fragment.to_lowercase());
        if self.non_retryable_errors.iter().any(matches) {
            return false;
        }
        if !self.retryable_errors.is_empty() {
            return self.retryable_errors.iter().any(matches);
        }
        true
    }

    /// Delay before retry number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_ms as f64;
        let raw = match self.strategy {
            EgRetryStrategy::Fixed => initial,
            EgRetryStrategy::Exponential => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                initial * self.backoff_multiplier.powi(exponent)
            }
            EgRetryStrategy::Linear => initial * (1.0 + attempt as f64),
        };
        let max = self.max_delay_ms as f64;
        let clamped = if raw.is_finite() { raw.min(max).max(0.0) } else { max };
        Duration::from_millis(clamped as u64)
    }
}

#[derive(Debug, Default)]
pub struct EgRetryPolicy {
    default_policy: RwLock<EgRetryPolicyConfig>,
    policies: RwLock<HashMap<String, EgRetryPolicyConfig>>,
}

impl EgRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(config: EgRetryPolicyConfig) -> Result<Self> {
        config.validate()?;
        Ok(EgRetryPolicy {
            default_policy: RwLock::new(config),
            policies: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_default_policy(&self, config: EgRetryPolicyConfig) -> Result<()> {
        config.validate()?;
        let mut guard = self
            .default_policy
            .write()
            .map_err(|_| EgError::internal("retry default policy lock poisoned"))?;
        *guard = config;
        Ok(())
    }

    pub fn set_policy(&self, key: &str, config: EgRetryPolicyConfig) -> Result<()> {
        config.validate()?;
        log::debug!(
            "resilience.retry.policy_set: retry policy configured - key={}, max_retries={}, strategy={:?}",
            key,
            config.max_retries,
            config.strategy
        );
        self.policies
            .write()
            .map_err(|_| EgError::internal("retry policy lock poisoned"))?
            .insert(key.to_string(), config);
        Ok(())
    }

    pub fn remove_policy(&self, key: &str) -> bool {
        self.policies
            .write()
            .map(|mut p| p.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Effective policy for `key`.
    pub fn policy(&self, key: &str) -> EgRetryPolicyConfig {
        if let Ok(policies) = self.policies.read() {
            if let Some(config) = policies.get(key) {
                return config.clone();
            }
        }
        self.default_policy
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// `attempt` counts retries already performed for this call.
    pub fn should_retry(&self, key: &str, attempt: u32, error: &str) -> bool {
        let config = self.policy(key);
        attempt < config.max_retries && config.is_retryable(error)
    }

    pub fn retry_delay(&self, key: &str, attempt: u32) -> Duration {
        self.policy(key).delay_for(attempt)
    }
}
