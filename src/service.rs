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

pub mod async_call;
pub mod descriptor;
pub mod registry;

pub use async_call::{EgAsyncServiceCall, EgServiceFuture};
pub use descriptor::{
    provider_address, EgMethodFn, EgMethodTable, EgProviderHandle, EgServiceDescriptor,
    EgServiceProvider,
};
pub use registry::{EgRegistryConfig, EgServiceRegistry, EgServiceStats};
