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

//! Plugin state snapshots and their on-disk store.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{duration_millis, EgError, Result};
use crate::plugin::metadata::EgPluginMetadata;

/// What a hot reload carries from the old plugin instance to the new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgPluginStateSnapshot {
    pub plugin_id: String,
    pub config: Value,
    /// Keys (`name@version`) of the services the plugin exported.
    pub loaded_services: Vec<String>,
    pub metadata: EgPluginMetadata,
    pub snapshot_time_ms: u64,
    /// Value returned by the plugin's `save_state`.
    pub plugin_state: Option<Value>,
}

impl EgPluginStateSnapshot {
    pub fn new(metadata: EgPluginMetadata) -> Self {
        EgPluginStateSnapshot {
            plugin_id: metadata.plugin_id.clone(),
            metadata,
            snapshot_time_ms: now_millis(),
            ..Default::default()
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or_default()
}

/// Directory of `<plugin_id>.snapshot.json` files, written atomically.
#[derive(Clone, Debug)]
pub struct EgStateStore {
    dir: PathBuf,
}

impl EgStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        EgStateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, plugin_id: &str) -> PathBuf {
        self.dir.join(format!("{}.snapshot.json", plugin_id))
    }

    pub fn save(&self, snapshot: &EgPluginStateSnapshot) -> Result<PathBuf> {
        if snapshot.plugin_id.is_empty() || snapshot.plugin_id.contains(|c: char| c == '/' || c == '\\') {
            return Err(EgError::validation(format!(
                "cannot persist snapshot for plugin id '{}'",
                snapshot.plugin_id
            )));
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(&snapshot.plugin_id);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp_path = self
            .dir
            .join(format!(".{}.snapshot.tmp.{}", snapshot.plugin_id, nanos));

        let mut file = File::create(&tmp_path)?;
        {
            let mut writer = BufWriter::new(&mut file);
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        file.sync_all()?;

        if path.exists() {
            fs::remove_file(&path)?;
        }
        fs::rename(&tmp_path, &path)?;
        log::debug!(
            "plugin.state.saved: snapshot persisted - plugin={}, path={}",
            snapshot.plugin_id,
            path.display()
        );
        Ok(path)
    }

    /// `None` when no snapshot exists for the plugin.
    pub fn load(&self, plugin_id: &str) -> Result<Option<EgPluginStateSnapshot>> {
        let path = self.snapshot_path(plugin_id);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    pub fn remove(&self, plugin_id: &str) -> Result<bool> {
        let path = self.snapshot_path(plugin_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
