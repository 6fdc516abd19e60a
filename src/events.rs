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

//! # Eagle Event Module
//!
//! Queued notification delivery for state changes inside the framework.
//!
//! Components publish events while they may still be inside their own
//! critical sections; publishing only enqueues. Subscribers run later, either
//! on the dispatcher thread started with [`EgEventBus::start_dispatcher`] or
//! when the owner drains the queue with [`EgEventBus::dispatch_pending`].
//! A subscriber can therefore call back into the emitting component without
//! deadlocking.
//!
//! The queue is bounded. Events published while nobody is subscribed are
//! discarded, and events published into a full queue are dropped and counted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::errors::{EgError, Result};
use crate::resilience::circuit_breaker::EgCircuitState;

/// Notifications emitted by the registry, resilience layer and plugin manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EgEvent {
    CircuitStateChanged {
        service: String,
        old_state: EgCircuitState,
        new_state: EgCircuitState,
    },
    InstanceHealthChanged {
        service: String,
        instance_id: String,
        healthy: bool,
    },
    ServiceRegistered {
        service: String,
        version: String,
    },
    ServiceUnregistered {
        service: String,
        version: String,
    },
    ServiceCallFailed {
        service: String,
        method: String,
        error: String,
        attempts: u32,
    },
    ServiceDegraded {
        service: String,
        method: String,
        strategy: String,
    },
    PluginLoaded {
        plugin_id: String,
    },
    PluginLoadFailed {
        plugin_id: String,
        error: String,
    },
    PluginUnloaded {
        plugin_id: String,
    },
    DependencyCycleDetected {
        plugin_id: String,
        cycle: Vec<String>,
    },
    ReloadStateChanged {
        plugin_id: String,
        state: String,
    },
}

impl EgEvent {
    /// Dotted event name in the same style as the log lines.
    pub fn name(&self) -> &'static str {
        match self {
            EgEvent::CircuitStateChanged { .. } => "resilience.circuit.state_changed",
            EgEvent::InstanceHealthChanged { .. } => "resilience.balancer.health_changed",
            EgEvent::ServiceRegistered { .. } => "service.registry.registered",
            EgEvent::ServiceUnregistered { .. } => "service.registry.unregistered",
            EgEvent::ServiceCallFailed { .. } => "service.call.failed",
            EgEvent::ServiceDegraded { .. } => "service.call.degraded",
            EgEvent::PluginLoaded { .. } => "plugin.manager.loaded",
            EgEvent::PluginLoadFailed { .. } => "plugin.manager.load_failed",
            EgEvent::PluginUnloaded { .. } => "plugin.manager.unloaded",
            EgEvent::DependencyCycleDetected { .. } => "plugin.manager.cycle_detected",
            EgEvent::ReloadStateChanged { .. } => "plugin.reload.state_changed",
        }
    }
}

/// Subscriber callback. Invoked once per delivered event.
pub type EgEventHandler = Arc<dyn Fn(&EgEvent) + Send + Sync>;

type EgSubscriberList = Arc<RwLock<Vec<(u64, EgEventHandler)>>>;

/// Identifier returned by [`EgEventBus::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EgSubscriptionId(u64);

/// Queue capacity used by [`EgEventBus::new`].
pub const EG_DEFAULT_EVENT_CAPACITY: usize = 4096;

/// Multi-producer event queue with deferred delivery.
pub struct EgEventBus {
    sender: Mutex<mpsc::SyncSender<EgEvent>>,
    receiver: Mutex<Option<mpsc::Receiver<EgEvent>>>,
    subscribers: EgSubscriberList,
    next_id: Mutex<u64>,
    capacity: usize,
    pending: Arc<AtomicUsize>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EgEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("dispatcher_running", &self.is_dispatching())
            .field("pending", &self.pending_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

impl Default for EgEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EgEventBus {
    pub fn new() -> Self {
        Self::with_capacity(EG_DEFAULT_EVENT_CAPACITY)
    }

    /// Bus holding at most `capacity` undelivered events (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::sync_channel::<EgEvent>(capacity);
        EgEventBus {
            sender: Mutex::new(tx),
            receiver: Mutex::new(Some(rx)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Mutex::new(1),
            capacity,
            pending: Arc::new(AtomicUsize::new(0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events queued and not yet delivered.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Events dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, handler: F) -> EgSubscriptionId
    where
        F: Fn(&EgEvent) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push((id, Arc::new(handler)));
        }
        EgSubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: EgSubscriptionId) -> bool {
        match self.subscribers.write() {
            Ok(mut subs) => {
                let before = subs.len();
                subs.retain(|(sub_id, _)| *sub_id != id.0);
                subs.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Enqueue an event. Never runs subscribers on the caller's stack and
    /// never blocks.
    pub fn publish(&self, event: EgEvent) {
        if self.subscriber_count() == 0 {
            return;
        }
        let name = event.name();
        let Ok(tx) = self.sender.lock() else {
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(event) {
            Ok(()) => log::debug!("events.bus.publish: event queued - event={}", name),
            Err(mpsc::TrySendError::Full(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                let dropped = self.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "events.bus.queue_full: event dropped - event={}, capacity={}, dropped={}",
                    name,
                    self.capacity,
                    dropped
                );
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Whether the background dispatcher owns the queue.
    pub fn is_dispatching(&self) -> bool {
        self.receiver.lock().map(|rx| rx.is_none()).unwrap_or(false)
    }

    /// Deliver every queued event on the current thread. Returns the number of
    /// events delivered; always zero once the dispatcher thread is running.
    pub fn dispatch_pending(&self) -> usize {
        let mut pending = Vec::new();
        if let Ok(guard) = self.receiver.lock() {
            if let Some(rx) = guard.as_ref() {
                while let Ok(event) = rx.try_recv() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    pending.push(event);
                }
            }
        }
        for event in &pending {
            _deliver(&self.subscribers, event);
        }
        pending.len()
    }

    /// Move delivery onto a dedicated thread. The thread exits once the bus
    /// is dropped.
    pub fn start_dispatcher(&self) -> Result<()> {
        let rx = {
            let mut guard = self
                .receiver
                .lock()
                .map_err(|_| EgError::internal("event receiver lock poisoned"))?;
            match guard.take() {
                Some(rx) => rx,
                None => return Ok(()),
            }
        };
        let subscribers = Arc::clone(&self.subscribers);
        let pending = Arc::clone(&self.pending);
        thread::Builder::new()
            .name("eagle-events".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    pending.fetch_sub(1, Ordering::SeqCst);
                    _deliver(&subscribers, &event);
                }
                log::debug!("events.bus.dispatcher_stopped: event channel closed");
            })
            .map_err(|e| EgError::internal(format!("failed to spawn event dispatcher: {}", e)))?;
        log::info!("events.bus.dispatcher_started: asynchronous event delivery enabled");
        Ok(())
    }
}

fn _deliver(subscribers: &EgSubscriberList, event: &EgEvent) {
    // Snapshot the list so handlers may subscribe or unsubscribe.
    let handlers: Vec<EgEventHandler> = match subscribers.read() {
        Ok(subs) => subs.iter().map(|(_, h)| Arc::clone(h)).collect(),
        Err(_) => return,
    };
    for handler in handlers {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event))).is_err() {
            log::error!(
                "events.bus.handler_panicked: subscriber panicked while handling event - event={}",
                event.name()
            );
        }
    }
}
