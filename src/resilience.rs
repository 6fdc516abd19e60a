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

//! # Eagle Resilience Module
//!
//! Decision components used by the service registry's call pipeline:
//!
//! - **circuit_breaker**: per-service Closed/Open/HalfOpen state machine
//! - **retry**: per-key retry decisions and backoff delays
//! - **degradation**: per-service fallback strategy selection
//! - **load_balancer**: per-service instance pools and dispatch algorithms
//!
//! None of these components invoke providers themselves.

pub mod circuit_breaker;
pub mod degradation;
pub mod load_balancer;
pub mod retry;

pub use circuit_breaker::{
    EgCircuitBreaker, EgCircuitBreakerConfig, EgCircuitBreakerStats, EgCircuitState,
};
pub use degradation::{
    EgDegradationPolicy, EgDegradationPolicyConfig, EgDegradationStrategy, EgDegradationTrigger,
};
pub use load_balancer::{EgLoadBalancer, EgLoadBalancingAlgorithm, EgServiceInstance};
pub use retry::{EgRetryPolicy, EgRetryPolicyConfig, EgRetryStrategy};
