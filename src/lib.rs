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

//! # Eagle Core Library
//!
//! Runtime orchestration core of the Eagle plugin framework: a service
//! registry that runs every call through a resilience pipeline, and a plugin
//! manager that loads, unloads and hot-reloads native modules.
//!
//! ## Module Overview
//!
//! - **errors**: `EgError` and the crate `Result`
//! - **events**: queued notification bus
//! - **monitor**: alert and performance sinks
//! - **resilience**: circuit breaker, retry, degradation, load balancing
//! - **service**: descriptors, the registry and asynchronous calls
//! - **plugin**: plugin API, loading, dependencies, signatures, hot reload
//! - **config**: framework configuration (YAML or JSON)
//! - **framework**: the composition root
//!
//! ## Feature Flags
//!
//! - `native-plugins` (default): load `cdylib` modules through `libloading`
//!
//! ## Quick Start
//!
//! ```rust
//! use eagle::{EgFramework, EgFrameworkConfig, EgMethodTable, EgServiceDescriptor};
//! use serde_json::json;
//!
//! let framework = EgFramework::new(EgFrameworkConfig::default()).unwrap();
//! let provider = EgMethodTable::new()
//!     .with_method("add", |args| {
//!         let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
//!         Ok(json!(sum))
//!     })
//!     .into_handle();
//! framework
//!     .registry()
//!     .register_service(EgServiceDescriptor::new("math", "1.0.0").with_provider(provider))
//!     .unwrap();
//!
//! let sum = framework
//!     .registry()
//!     .call_service("math", "add", &[json!(2), json!(3)], None)
//!     .unwrap();
//! assert_eq!(sum, json!(5));
//! ```
//!
//! ## Call Pipeline
//!
//! 1. Circuit breaker admission
//! 2. Instance selection through the load balancer
//! 3. Method dispatch through the provider
//! 4. Retry with backoff on failure
//! 5. Degradation once retries are exhausted
//!
//! ## Error Handling
//!
//! Fallible operations return `Result<T, EgError>`. Plugin and provider
//! panics are caught at the boundary and surface as `EgError::Invocation`.

pub mod config;
pub mod errors;
pub mod events;
pub mod framework;
pub mod monitor;
pub mod plugin;
pub mod resilience;
pub mod service;

pub use config::EgFrameworkConfig;
pub use errors::{EgError, Result};
pub use events::{EgEvent, EgEventBus, EgEventHandler, EgSubscriptionId};
pub use framework::EgFramework;
pub use monitor::{
    EgAlertSeverity, EgAlertSink, EgLogMonitor, EgMetricsCollector, EgPerformanceMonitor,
    EgTimingSummary,
};

pub use resilience::{
    EgCircuitBreaker, EgCircuitBreakerConfig, EgCircuitBreakerStats, EgCircuitState,
    EgDegradationPolicy, EgDegradationPolicyConfig, EgDegradationStrategy, EgDegradationTrigger,
    EgLoadBalancer, EgLoadBalancingAlgorithm, EgRetryPolicy, EgRetryPolicyConfig,
    EgRetryStrategy, EgServiceInstance,
};
pub use service::{
    EgAsyncServiceCall, EgMethodTable, EgProviderHandle, EgRegistryConfig, EgServiceDescriptor,
    EgServiceFuture, EgServiceProvider, EgServiceRegistry, EgServiceStats,
};

pub use plugin::{
    EgBatchReloadResult, EgDependencyGraph, EgHotReloadConfig, EgHotReloadManager,
    EgModuleLoader, EgPlugin, EgPluginContext, EgPluginManager, EgPluginManagerConfig,
    EgPluginMetadata, EgPluginStateSnapshot, EgReloadResult, EgReloadState,
    EgStaticModuleLoader,
};
