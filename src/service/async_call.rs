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

//! # Asynchronous Service Calls
//!
//! Runs registry calls on a bounded rayon pool and hands back an
//! [`EgServiceFuture`]. A future is completed exactly once; waiters block on
//! a condition variable and callbacks attached before completion run on the
//! completing thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::errors::{duration_millis, panic_message, EgError, Result};
use crate::service::registry::EgServiceRegistry;

enum EgFutureCallback {
    Then(Box<dyn FnOnce(&Value) + Send>),
    OnError(Box<dyn FnOnce(&EgError) + Send>),
    Finally(Box<dyn FnOnce() + Send>),
}

impl EgFutureCallback {
    fn run(self, result: &Result<Value>) {
        match (self, result) {
            (EgFutureCallback::Then(f), Ok(value)) => f(value),
            (EgFutureCallback::OnError(f), Err(err)) => f(err),
            (EgFutureCallback::Finally(f), _) => f(),
            _ => {}
        }
    }
}

#[derive(Default)]
struct EgFutureState {
    result: Option<Result<Value>>,
    callbacks: Vec<EgFutureCallback>,
}

/// Handle to the eventual result of an asynchronous call. Clones share the
/// same result.
#[derive(Clone, Default)]
pub struct EgServiceFuture {
    shared: Arc<(Mutex<EgFutureState>, Condvar)>,
}

impl std::fmt::Debug for EgServiceFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgServiceFuture")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl EgServiceFuture {
    /// An unfinished future.
    pub fn new() -> Self {
        Self::default()
    }

    /// A future that is already complete.
    pub fn ready(result: Result<Value>) -> Self {
        let future = Self::new();
        future.complete(result);
        future
    }

    fn lock(&self) -> MutexGuard<'_, EgFutureState> {
        self.shared.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the result. Only the first call has an effect; returns whether
    /// this call set it.
    pub fn complete(&self, result: Result<Value>) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.shared.1.notify_all();
        for callback in callbacks {
            callback.run(&result);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.lock().result.is_some()
    }

    /// The value, if finished successfully.
    pub fn result(&self) -> Option<Value> {
        match &self.lock().result {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The error, if finished with one.
    pub fn error(&self) -> Option<EgError> {
        match &self.lock().result {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Block until finished. `None` waits indefinitely; an elapsed deadline
    /// yields a `Timeout` error without completing the future.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Value> {
        let started = Instant::now();
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            match timeout {
                None => {
                    state = cvar.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(EgError::timeout(
                            "future",
                            "wait",
                            duration_millis(elapsed),
                            duration_millis(limit),
                        ));
                    }
                    let (guard, _) = cvar
                        .wait_timeout(state, limit - elapsed)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
    }

    fn _attach(&self, callback: EgFutureCallback) -> &Self {
        let finished = {
            let mut state = self.lock();
            match &state.result {
                Some(result) => Some((result.clone(), callback)),
                None => {
                    state.callbacks.push(callback);
                    None
                }
            }
        };
        if let Some((result, callback)) = finished {
            callback.run(&result);
        }
        self
    }

    /// Run `f` with the value on success.
    pub fn then<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self._attach(EgFutureCallback::Then(Box::new(f)))
    }

    /// Run `f` with the error on failure.
    pub fn on_error<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&EgError) + Send + 'static,
    {
        self._attach(EgFutureCallback::OnError(Box::new(f)))
    }

    /// Run `f` once finished, whatever the outcome.
    pub fn finally<F>(&self, f: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self._attach(EgFutureCallback::Finally(Box::new(f)))
    }

    /// Wait for every future under one shared deadline.
    pub fn wait_for_all(futures: &[EgServiceFuture], timeout: Option<Duration>) -> Vec<Result<Value>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        futures
            .iter()
            .map(|future| {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                future.wait(remaining)
            })
            .collect()
    }

    /// Index of the first finished future, polling until the deadline.
    pub fn wait_for_any(futures: &[EgServiceFuture], timeout: Option<Duration>) -> Option<usize> {
        if futures.is_empty() {
            return None;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(idx) = futures.iter().position(|f| f.is_finished()) {
                return Some(idx);
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return None;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

/// Dispatches registry calls onto a worker pool.
pub struct EgAsyncServiceCall {
    registry: Arc<EgServiceRegistry>,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for EgAsyncServiceCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgAsyncServiceCall")
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl EgAsyncServiceCall {
    /// `workers` of 0 sizes the pool to the CPU count.
    pub fn new(registry: Arc<EgServiceRegistry>, workers: usize) -> Result<Self> {
        let workers = if workers == 0 { num_cpus::get().max(1) } else { workers };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|idx| format!("eagle-async-{}", idx))
            .build()
            .map_err(|e| EgError::internal(format!("failed to build async worker pool: {}", e)))?;
        log::debug!(
            "service.async.pool_started: async worker pool ready - workers={}",
            workers
        );
        Ok(EgAsyncServiceCall { registry, pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn call_async(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> EgServiceFuture {
        let future = EgServiceFuture::new();
        let completion = future.clone();
        let registry = Arc::clone(&self.registry);
        let service = service.to_string();
        let method = method.to_string();
        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                registry.call_service(&service, &method, &args, timeout)
            }));
            let result = outcome.unwrap_or_else(|payload| {
                Err(EgError::invocation(
                    &service,
                    &method,
                    format!("async call panicked: {}", panic_message(payload.as_ref())),
                ))
            });
            completion.complete(result);
        });
        future
    }
}
