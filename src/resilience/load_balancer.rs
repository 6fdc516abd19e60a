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

//! # Load Balancer
//!
//! Per-service pools of provider instances. Selection only considers healthy
//! instances.
//!
//! ## Algorithms
//!
//! - **RoundRobin**: cyclic index over the healthy set
//! - **WeightedRoundRobin**: counter modulo total weight, cumulative buckets
//! - **LeastConnections**: fewest active connections, ties by registration order
//! - **Random**: uniform choice
//! - **IPHash**: xxh3 of the client id; the chosen instance is remembered for
//!   that client while it stays healthy. An empty client id uses RoundRobin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::errors::{EgError, Result};
use crate::events::{EgEvent, EgEventBus};
use crate::service::descriptor::{provider_address, EgServiceDescriptor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EgLoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    IPHash,
}

/// One provider registered under a service.
#[derive(Clone, Debug)]
pub struct EgServiceInstance {
    pub instance_id: String,
    pub descriptor: EgServiceDescriptor,
    pub weight: u32,
    pub active_connections: u64,
    pub total_requests: u64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct EgServicePool {
    instances: Vec<EgServiceInstance>,
    algorithm: EgLoadBalancingAlgorithm,
    rr_index: usize,
    weight_counter: u64,
    affinity: HashMap<String, String>,
}

impl EgServicePool {
    fn healthy_indices(&self) -> Vec<usize> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.healthy)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn position(&self, instance_id: &str) -> Option<usize> {
        self.instances
            .iter()
            .position(|inst| inst.instance_id == instance_id)
    }

    fn next_round_robin(&mut self, healthy: &[usize]) -> usize {
        let idx = healthy[self.rr_index % healthy.len()];
        self.rr_index = self.rr_index.wrapping_add(1);
        idx
    }

    fn select(&mut self, client_id: Option<&str>) -> Option<usize> {
        let healthy = self.healthy_indices();
        if healthy.is_empty() {
            return None;
        }
        let chosen = match self.algorithm {
            EgLoadBalancingAlgorithm::RoundRobin => self.next_round_robin(&healthy),
            EgLoadBalancingAlgorithm::WeightedRoundRobin => {
                let total: u64 = healthy
                    .iter()
                    .map(|&i| self.instances[i].weight.max(1) as u64)
                    .sum();
                let slot = self.weight_counter % total;
                self.weight_counter = self.weight_counter.wrapping_add(1);
                let mut cumulative = 0u64;
                let mut pick = healthy[healthy.len() - 1];
                for &i in &healthy {
                    cumulative += self.instances[i].weight.max(1) as u64;
                    if slot < cumulative {
                        pick = i;
                        break;
                    }
                }
                pick
            }
            EgLoadBalancingAlgorithm::LeastConnections => {
                let mut best = healthy[0];
                for &i in &healthy[1..] {
                    if self.instances[i].active_connections < self.instances[best].active_connections {
                        best = i;
                    }
                }
                best
            }
            EgLoadBalancingAlgorithm::Random => {
                let pos = rand::thread_rng().gen_range(0..healthy.len());
                healthy[pos]
            }
            EgLoadBalancingAlgorithm::IPHash => match client_id.filter(|c| !c.is_empty()) {
                None => self.next_round_robin(&healthy),
                Some(client) => {
                    let cached = self
                        .affinity
                        .get(client)
                        .and_then(|id| self.position(id))
                        .filter(|&i| self.instances[i].healthy);
                    match cached {
                        Some(i) => i,
                        None => {
                            let hash = xxh3_64(client.as_bytes());
                            let i = healthy[(hash % healthy.len() as u64) as usize];
                            self.affinity
                                .insert(client.to_string(), self.instances[i].instance_id.clone());
                            i
                        }
                    }
                }
            },
        };
        Some(chosen)
    }
}

/// Instance pools keyed by service name.
#[derive(Debug, Default)]
pub struct EgLoadBalancer {
    pools: Mutex<HashMap<String, EgServicePool>>,
    default_algorithm: Mutex<EgLoadBalancingAlgorithm>,
    events: Option<Arc<EgEventBus>>,
}

impl EgLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(mut self, events: Arc<EgEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EgServicePool>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Instance id `service_name@version@provider_address`, if the
    /// descriptor carries a provider.
    pub fn instance_id_of(descriptor: &EgServiceDescriptor) -> Option<String> {
        let provider = descriptor.provider.as_ref()?;
        Some(format!(
            "{}@{}@{:#x}",
            descriptor.service_name,
            descriptor.version,
            provider_address(provider)
        ))
    }

    /// Algorithm given to services registered from now on.
    pub fn set_default_algorithm(&self, algorithm: EgLoadBalancingAlgorithm) {
        *self.default_algorithm.lock().unwrap_or_else(|e| e.into_inner()) = algorithm;
    }

    /// Add a provider instance and return its id. Registering the same
    /// provider twice refreshes the descriptor and weight.
    pub fn register_instance(
        &self,
        service: &str,
        descriptor: EgServiceDescriptor,
        weight: u32,
    ) -> Result<String> {
        let instance_id = Self::instance_id_of(&descriptor).ok_or_else(|| {
            EgError::validation(format!("instance of service '{}' has no provider", service))
        })?;
        let default_algorithm = *self.default_algorithm.lock().unwrap_or_else(|e| e.into_inner());
        let mut pools = self.lock();
        let pool = pools.entry(service.to_string()).or_insert_with(|| EgServicePool {
            algorithm: default_algorithm,
            ..Default::default()
        });
        let weight = weight.max(1);
        match pool.position(&instance_id) {
            Some(idx) => {
                let inst = &mut pool.instances[idx];
                inst.descriptor = descriptor;
                inst.weight = weight;
            }
            None => pool.instances.push(EgServiceInstance {
                instance_id: instance_id.clone(),
                descriptor,
                weight,
                active_connections: 0,
                total_requests: 0,
                healthy: true,
            }),
        }
        log::debug!(
            "resilience.balancer.instance_registered: instance registered - service={}, instance={}, weight={}, pool_size={}",
            service,
            instance_id,
            weight,
            pool.instances.len()
        );
        Ok(instance_id)
    }

    pub fn unregister_instance(&self, service: &str, instance_id: &str) -> bool {
        let mut pools = self.lock();
        let Some(pool) = pools.get_mut(service) else {
            return false;
        };
        let Some(idx) = pool.position(instance_id) else {
            return false;
        };
        pool.instances.remove(idx);
        pool.affinity.retain(|_, id| id != instance_id);
        if pool.instances.is_empty() {
            pools.remove(service);
        }
        log::debug!(
            "resilience.balancer.instance_unregistered: instance removed - service={}, instance={}",
            service,
            instance_id
        );
        true
    }

    pub fn unregister_service(&self, service: &str) -> usize {
        self.lock()
            .remove(service)
            .map(|pool| pool.instances.len())
            .unwrap_or(0)
    }

    /// Pick a healthy instance. Returns a snapshot; the provider handle inside
    /// is shared with the pool.
    pub fn select_instance(&self, service: &str, client_id: Option<&str>) -> Option<EgServiceInstance> {
        let mut pools = self.lock();
        let pool = pools.get_mut(service)?;
        let idx = pool.select(client_id)?;
        Some(pool.instances[idx].clone())
    }

    pub fn on_service_call_start(&self, service: &str, instance_id: &str) {
        let mut pools = self.lock();
        if let Some(inst) = _instance_mut(&mut pools, service, instance_id) {
            inst.active_connections += 1;
            inst.total_requests += 1;
        }
    }

    pub fn on_service_call_end(&self, service: &str, instance_id: &str) {
        let mut pools = self.lock();
        if let Some(inst) = _instance_mut(&mut pools, service, instance_id) {
            inst.active_connections = inst.active_connections.saturating_sub(1);
        }
    }

    /// Returns false for unknown instances. Publishes only on transitions.
    pub fn set_instance_health(&self, service: &str, instance_id: &str, healthy: bool) -> bool {
        let changed = {
            let mut pools = self.lock();
            match _instance_mut(&mut pools, service, instance_id) {
                Some(inst) => {
                    let changed = inst.healthy != healthy;
                    inst.healthy = healthy;
                    Some(changed)
                }
                None => None,
            }
        };
        match changed {
            None => false,
            Some(false) => true,
            Some(true) => {
                log::info!(
                    "resilience.balancer.health_changed: instance health changed - service={}, instance={}, healthy={}",
                    service,
                    instance_id,
                    healthy
                );
                if let Some(events) = &self.events {
                    events.publish(EgEvent::InstanceHealthChanged {
                        service: service.to_string(),
                        instance_id: instance_id.to_string(),
                        healthy,
                    });
                }
                true
            }
        }
    }

    pub fn set_instance_weight(&self, service: &str, instance_id: &str, weight: u32) -> bool {
        let mut pools = self.lock();
        match _instance_mut(&mut pools, service, instance_id) {
            Some(inst) => {
                inst.weight = weight.max(1);
                true
            }
            None => false,
        }
    }

    pub fn set_algorithm(&self, service: &str, algorithm: EgLoadBalancingAlgorithm) -> bool {
        let mut pools = self.lock();
        match pools.get_mut(service) {
            Some(pool) => {
                pool.algorithm = algorithm;
                pool.affinity.clear();
                log::info!(
                    "resilience.balancer.algorithm_set: load balancing algorithm changed - service={}, algorithm={:?}",
                    service,
                    algorithm
                );
                true
            }
            None => false,
        }
    }

    pub fn algorithm(&self, service: &str) -> Option<EgLoadBalancingAlgorithm> {
        self.lock().get(service).map(|pool| pool.algorithm)
    }

    pub fn instances(&self, service: &str) -> Vec<EgServiceInstance> {
        self.lock()
            .get(service)
            .map(|pool| pool.instances.clone())
            .unwrap_or_default()
    }

    pub fn healthy_instance_count(&self, service: &str) -> usize {
        self.lock()
            .get(service)
            .map(|pool| pool.instances.iter().filter(|i| i.healthy).count())
            .unwrap_or(0)
    }

    pub fn has_instances(&self, service: &str) -> bool {
        self.lock()
            .get(service)
            .map(|pool| !pool.instances.is_empty())
            .unwrap_or(false)
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

fn _instance_mut<'a>(
    pools: &'a mut HashMap<String, EgServicePool>,
    service: &str,
    instance_id: &str,
) -> Option<&'a mut EgServiceInstance> {
    pools
        .get_mut(service)?
        .instances
        .iter_mut()
        .find(|inst| inst.instance_id == instance_id)
}
