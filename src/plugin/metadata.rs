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

use serde::{Deserialize, Serialize};

use crate::errors::{EgError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgPluginCategory {
    #[serde(rename = "ui", alias = "UI")]
    Ui,
    #[default]
    #[serde(rename = "service", alias = "Service")]
    Service,
    #[serde(rename = "tool", alias = "Tool")]
    Tool,
}

/// Self-reported description of a plugin, captured when its module is
/// probed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgPluginMetadata {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    /// Plugin ids that must be loaded first.
    pub dependencies: Vec<String>,
    pub permissions: Vec<String>,
    pub category: EgPluginCategory,
}

impl EgPluginMetadata {
    pub fn new(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        EgPluginMetadata {
            name: plugin_id.clone(),
            plugin_id,
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn with_category(mut self, category: EgPluginCategory) -> Self {
        self.category = category;
        self
    }

    pub fn depends_on(&self, plugin_id: &str) -> bool {
        self.dependencies.iter().any(|d| d == plugin_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_id.trim().is_empty() {
            return Err(EgError::validation("plugin metadata has an empty plugin_id"));
        }
        if self.version.trim().is_empty() {
            return Err(EgError::validation(format!(
                "plugin '{}' has an empty version",
                self.plugin_id
            )));
        }
        if self.depends_on(&self.plugin_id) {
            return Err(EgError::dependency(
                self.plugin_id.clone(),
                "plugin lists itself as a dependency",
            ));
        }
        Ok(())
    }
}
