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

//! Alerting and performance sinks consumed by the core.
//!
//! Both sinks are fire-and-forget: implementations must not block the caller
//! for long and must not call back into the component that reports to them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgAlertSeverity {
    Info,
    Warning,
    Critical,
}

impl EgAlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgAlertSeverity::Info => "INFO",
            EgAlertSeverity::Warning => "WARNING",
            EgAlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// Receives operational alerts such as dependency cycles.
pub trait EgAlertSink: Send + Sync {
    fn raise_alert(&self, severity: EgAlertSeverity, source: &str, message: &str);
}

/// Receives plugin load times and service call latencies.
pub trait EgPerformanceMonitor: Send + Sync {
    fn record_plugin_load(&self, plugin_id: &str, duration: Duration, success: bool);
    fn record_service_call(&self, service: &str, method: &str, duration: Duration, success: bool);
}

/// Default sink that forwards everything to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct EgLogMonitor;

impl EgAlertSink for EgLogMonitor {
    fn raise_alert(&self, severity: EgAlertSeverity, source: &str, message: &str) {
        match severity {
            EgAlertSeverity::Info => log::info!(
                "monitor.alert.raised: {} - severity={}, source={}",
                message,
                severity.as_str(),
                source
            ),
            EgAlertSeverity::Warning => log::warn!(
                "monitor.alert.raised: {} - severity={}, source={}",
                message,
                severity.as_str(),
                source
            ),
            EgAlertSeverity::Critical => log::error!(
                "monitor.alert.raised: {} - severity={}, source={}",
                message,
                severity.as_str(),
                source
            ),
        }
    }
}

impl EgPerformanceMonitor for EgLogMonitor {
    fn record_plugin_load(&self, plugin_id: &str, duration: Duration, success: bool) {
        log::debug!(
            "monitor.perf.plugin_load: plugin load measured - plugin={}, duration_ms={}, success={}",
            plugin_id,
            duration.as_millis(),
            success
        );
    }

    fn record_service_call(&self, service: &str, method: &str, duration: Duration, success: bool) {
        log::debug!(
            "monitor.perf.service_call: service call measured - service={}, method={}, duration_ms={}, success={}",
            service,
            method,
            duration.as_millis(),
            success
        );
    }
}

/// Aggregated timings for one measured key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EgTimingSummary {
    pub count: u64,
    pub failures: u64,
    pub total_micros: u128,
    pub max_micros: u128,
}

impl EgTimingSummary {
    fn record(&mut self, duration: Duration, success: bool) {
        let micros = duration.as_micros();
        self.count += 1;
        if !success {
            self.failures += 1;
        }
        self.total_micros += micros;
        self.max_micros = self.max_micros.max(micros);
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((self.total_micros / self.count as u128) as u64)
    }
}

/// In-memory collector used by diagnostics and tests. Keeps alert history
/// and per-key timing summaries.
#[derive(Debug, Default)]
pub struct EgMetricsCollector {
    plugin_loads: Mutex<HashMap<String, EgTimingSummary>>,
    service_calls: Mutex<HashMap<String, EgTimingSummary>>,
    alerts: Mutex<Vec<(EgAlertSeverity, String, String)>>,
}

impl EgMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin_load_summary(&self, plugin_id: &str) -> Option<EgTimingSummary> {
        self.plugin_loads.lock().ok()?.get(plugin_id).cloned()
    }

    /// Summary keyed by `service::method`.
    pub fn service_call_summary(&self, service: &str, method: &str) -> Option<EgTimingSummary> {
        self.service_calls
            .lock()
            .ok()?
            .get(&format!("{}::{}", service, method))
            .cloned()
    }

    pub fn alerts(&self) -> Vec<(EgAlertSeverity, String, String)> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl EgAlertSink for EgMetricsCollector {
    fn raise_alert(&self, severity: EgAlertSeverity, source: &str, message: &str) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push((severity, source.to_string(), message.to_string()));
        }
    }
}

impl EgPerformanceMonitor for EgMetricsCollector {
    fn record_plugin_load(&self, plugin_id: &str, duration: Duration, success: bool) {
        if let Ok(mut loads) = self.plugin_loads.lock() {
            loads
                .entry(plugin_id.to_string())
                .or_default()
                .record(duration, success);
        }
    }

    fn record_service_call(&self, service: &str, method: &str, duration: Duration, success: bool) {
        if let Ok(mut calls) = self.service_calls.lock() {
            calls
                .entry(format!("{}::{}", service, method))
                .or_default()
                .record(duration, success);
        }
    }
}
