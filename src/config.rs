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

//! # Eagle Configuration
//!
//! ```yaml
//! plugins:
//!   paths: ["./plugins"]
//!   auto_load: ["core"]
//!   require_signature: true
//!   trusted_issuers: { "eagle-ca": "<base64 key>" }
//! services:
//!   default_timeout_ms: 5000
//!   retry: { max_retries: 2, strategy: Exponential }
//! hot_reload:
//!   grace_ms: 500
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{EgError, Result};
use crate::plugin::hot_reload::EgHotReloadConfig;
use crate::plugin::manager::EgPluginManagerConfig;
use crate::service::registry::EgRegistryConfig;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgFrameworkConfig {
    pub plugins: EgPluginManagerConfig,
    pub services: EgRegistryConfig,
    pub hot_reload: EgHotReloadConfig,
}

impl EgFrameworkConfig {
    /// Load YAML (`.yaml`, `.yml`) or JSON (anything else) and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        let config: Self = if is_yaml {
            if text.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str(&text)?
            }
        } else {
            serde_json::from_str(&text)?
        };
        config.validate()?;
        log::info!(
            "config.framework.loaded: configuration loaded - path={}, plugin_paths={}",
            path.display(),
            config.plugins.paths.len()
        );
        Ok(config)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.services.validate()?;
        if self.plugins.require_signature
            && self.plugins.signature.require_chain
            && self.plugins.signature.trusted_issuers.is_empty()
        {
            return Err(EgError::validation(
                "plugins.require_chain needs at least one trusted issuer",
            ));
        }
        if self.plugins.auto_load.iter().any(|id| id.trim().is_empty()) {
            return Err(EgError::validation("plugins.auto_load contains an empty id"));
        }
        Ok(())
    }
}
