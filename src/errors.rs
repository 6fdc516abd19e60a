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

//! # Eagle Error Module
//!
//! This module defines the error taxonomy shared by the service registry, the
//! resilience components and the plugin manager.
//!
//! ## Error Categories
//!
//! - **NotFound**: Unknown service, method or plugin
//! - **Validation**: Invalid descriptor, metadata or configuration
//! - **Dependency**: Missing or cyclic plugin dependencies
//! - **CircuitOpen**: Call rejected by an open circuit breaker
//! - **Timeout**: Call exceeded its deadline
//! - **Invocation**: Provider or plugin call failed, returned an error or panicked
//! - **Signature**: Plugin signature missing, invalid, expired or revoked
//! - **Io**: Filesystem errors
//! - **Serde**: Serialization/deserialization errors
//! - **Internal**: Unexpected internal failures
//!
//! Resilience components never produce errors while deciding; they return
//! booleans and leave the interpretation to the registry.

use std::any::Any;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type used throughout Eagle.
pub type Result<T> = std::result::Result<T, EgError>;

/// Canonical error enumeration for Eagle.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq)]
pub enum EgError {
    /// Unknown service, method or plugin.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Invalid descriptor, metadata or configuration.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Missing or cyclic plugin dependencies.
    #[error("dependency error for plugin '{plugin}': {message}")]
    Dependency { plugin: String, message: String },

    /// Call rejected because the service's circuit breaker is open.
    #[error("circuit breaker is open for service '{service}'")]
    CircuitOpen { service: String },

    /// Call exceeded its deadline.
    #[error("call to '{target}::{method}' timed out after {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    Timeout {
        target: String,
        method: String,
        elapsed_ms: u64,
        timeout_ms: u64,
    },

    /// The target of a call failed, returned an error or panicked.
    #[error("invocation of '{target}::{method}' failed: {message}")]
    Invocation {
        target: String,
        method: String,
        message: String,
    },

    /// Plugin signature missing, invalid, expired or revoked.
    #[error("signature error for plugin '{plugin}': {message}")]
    Signature { plugin: String, message: String },

    /// Errors originating from filesystem IO.
    #[error("io error: {0}")]
    Io(String),

    /// Wrapper for serde-style serialization issues.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Catch-all variant for unexpected situations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for EgError {
    fn from(err: io::Error) -> Self {
        EgError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EgError {
    fn from(err: serde_json::Error) -> Self {
        EgError::Serde(err.to_string())
    }
}

impl From<serde_yaml::Error> for EgError {
    fn from(err: serde_yaml::Error) -> Self {
        EgError::Serde(err.to_string())
    }
}

impl EgError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        EgError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Helper to construct simple validation errors.
    pub fn validation<T: Into<String>>(message: T) -> Self {
        EgError::Validation {
            message: message.into(),
        }
    }

    pub fn dependency(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        EgError::Dependency {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn circuit_open(service: impl Into<String>) -> Self {
        EgError::CircuitOpen {
            service: service.into(),
        }
    }

    pub fn timeout(
        target: impl Into<String>,
        method: impl Into<String>,
        elapsed_ms: u64,
        timeout_ms: u64,
    ) -> Self {
        EgError::Timeout {
            target: target.into(),
            method: method.into(),
            elapsed_ms,
            timeout_ms,
        }
    }

    pub fn invocation(
        target: impl Into<String>,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EgError::Invocation {
            target: target.into(),
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn signature(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        EgError::Signature {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Helper to construct internal errors.
    pub fn internal<T: Into<String>>(message: T) -> Self {
        EgError::Internal(message.into())
    }

    /// Short category name, used in log lines and failure events.
    pub fn kind(&self) -> &'static str {
        match self {
            EgError::NotFound { .. } => "not_found",
            EgError::Validation { .. } => "validation",
            EgError::Dependency { .. } => "dependency",
            EgError::CircuitOpen { .. } => "circuit_open",
            EgError::Timeout { .. } => "timeout",
            EgError::Invocation { .. } => "invocation",
            EgError::Signature { .. } => "signature",
            EgError::Io(_) => "io",
            EgError::Serde(_) => "serde",
            EgError::Internal(_) => "internal",
        }
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Extract a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
