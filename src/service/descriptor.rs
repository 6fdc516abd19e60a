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

//! # Service Descriptors and Providers
//!
//! A provider is any object that can dispatch a method by name with JSON
//! arguments. [`EgMethodTable`] is the stock provider: a name → closure table
//! built once at registration time.
//!
//! A descriptor names a provider and the methods it exposes under a
//! `service_name@version` key.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::{EgError, Result};

/// Dispatch surface for a registered service.
pub trait EgServiceProvider: Send + Sync {
    /// Names of every method this provider can dispatch.
    fn method_names(&self) -> Vec<String>;

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value>;

    fn has_method(&self, method: &str) -> bool {
        self.method_names().iter().any(|m| m == method)
    }
}

/// Shared handle to a provider. Instances in the load balancer, the registry
/// and the owning plugin all hold clones.
pub type EgProviderHandle = Arc<dyn EgServiceProvider>;

/// Stable address of a provider, used to build instance ids.
pub fn provider_address(provider: &EgProviderHandle) -> usize {
    Arc::as_ptr(provider) as *const () as usize
}

pub type EgMethodFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Provider backed by a table of closures.
#[derive(Clone, Default)]
pub struct EgMethodTable {
    methods: HashMap<String, EgMethodFn>,
}

impl std::fmt::Debug for EgMethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("EgMethodTable").field("methods", &names).finish()
    }
}

impl EgMethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(name, method);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn into_handle(self) -> EgProviderHandle {
        Arc::new(self)
    }
}

impl EgServiceProvider for EgMethodTable {
    fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    fn invoke(&self, method: &str, args: &[Value]) -> Result<Value> {
        let func = self
            .methods
            .get(method)
            .ok_or_else(|| EgError::not_found("method", method))?;
        func(args)
    }

    fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }
}

#[derive(Clone)]
pub struct EgServiceDescriptor {
    pub service_name: String,
    pub version: String,
    pub methods: Vec<String>,
    pub endpoints: Vec<String>,
    /// Method invoked by health checks. Empty disables active checks.
    pub health_check_path: String,
    pub provider: Option<EgProviderHandle>,
}

impl std::fmt::Debug for EgServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgServiceDescriptor")
            .field("service_name", &self.service_name)
            .field("version", &self.version)
            .field("methods", &self.methods)
            .field("endpoints", &self.endpoints)
            .field("health_check_path", &self.health_check_path)
            .field("provider", &self.provider.as_ref().map(provider_address))
            .finish()
    }
}

impl EgServiceDescriptor {
    pub fn new(service_name: impl Into<String>, version: impl Into<String>) -> Self {
        EgServiceDescriptor {
            service_name: service_name.into(),
            version: version.into(),
            methods: Vec::new(),
            endpoints: Vec::new(),
            health_check_path: String::new(),
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: EgProviderHandle) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_health_check(mut self, method: impl Into<String>) -> Self {
        self.health_check_path = method.into();
        self
    }

    /// Identity key `service_name@version`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.service_name, self.version)
    }

    /// Check the registration invariants and fill an empty method list from
    /// the provider.
    pub fn normalize(&mut self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(EgError::validation("service name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(EgError::validation(format!(
                "service '{}' has an empty version",
                self.service_name
            )));
        }
        let provider = self.provider.as_ref().ok_or_else(|| {
            EgError::validation(format!("service '{}' has no provider", self.key()))
        })?;
        if self.methods.is_empty() {
            self.methods = provider.method_names();
            return Ok(());
        }
        if let Some(missing) = self.methods.iter().find(|m| !provider.has_method(m)) {
            return Err(EgError::validation(format!(
                "service '{}' declares method '{}' which its provider does not implement",
                self.key(),
                missing
            )));
        }
        Ok(())
    }
}
