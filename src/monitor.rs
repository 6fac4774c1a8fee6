//! Production monitoring — health status, metrics snapshot, alerting.
//!
//! Adapted from the production monitor pattern: a `RwLock`-guarded
//! snapshot updated by the dispatcher and gateway, a broadcast channel
//! for alert subscribers, and `metrics` macro calls mirrored into
//! Prometheus-style gauges/counters for whatever recorder the binary
//! installs.

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::model::Precedence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub flash: usize,
    pub immediate: usize,
    pub priority: usize,
    pub routine: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queue_depths: QueueSnapshot,
    pub connected_nodes: u32,
    pub total_nodes: u32,
    pub dispatch_attempts: u64,
    pub dispatch_successes: u64,
    pub dispatch_transient_failures: u64,
    pub dispatch_permanent_failures: u64,
    pub expired_messages: u64,
    pub auth_failures: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub queue_warning_fraction: f64,
    pub queue_critical_fraction: f64,
    pub auth_failure_burst_threshold: u64,
    pub alert_cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            queue_warning_fraction: 0.6,
            queue_critical_fraction: 0.9,
            auth_failure_burst_threshold: 20,
            alert_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub severity: HealthStatus,
    pub component: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

struct Counters {
    dispatch_attempts: AtomicU64,
    dispatch_successes: AtomicU64,
    dispatch_transient_failures: AtomicU64,
    dispatch_permanent_failures: AtomicU64,
    expired_messages: AtomicU64,
    auth_failures: AtomicU64,
    rate_limited: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            dispatch_attempts: AtomicU64::new(0),
            dispatch_successes: AtomicU64::new(0),
            dispatch_transient_failures: AtomicU64::new(0),
            dispatch_permanent_failures: AtomicU64::new(0),
            expired_messages: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }
}

pub struct ProductionMonitor {
    alerts: AlertConfig,
    counters: Counters,
    queue_depths: RwLock<QueueSnapshot>,
    node_counts: RwLock<(u32, u32)>,
    alert_sender: broadcast::Sender<AlertEvent>,
    last_alerts: Arc<DashMap<String, Instant>>,
    start_time: Instant,
}

impl ProductionMonitor {
    pub fn new(alerts: AlertConfig) -> Self {
        let (alert_sender, _) = broadcast::channel(1000);
        Self {
            alerts,
            counters: Counters::new(),
            queue_depths: RwLock::new(QueueSnapshot {
                flash: 0,
                immediate: 0,
                priority: 0,
                routine: 0,
            }),
            node_counts: RwLock::new((0, 0)),
            alert_sender,
            last_alerts: Arc::new(DashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn subscribe_to_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_sender.subscribe()
    }

    pub fn record_dispatch_attempt(&self) {
        self.counters.dispatch_attempts.fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_dispatch_attempts_total", 1);
    }

    pub fn record_dispatch_success(&self, precedence: Precedence) {
        self.counters.dispatch_successes.fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_dispatch_success_total", 1, "precedence" => precedence.as_str());
    }

    pub fn record_dispatch_latency(&self, precedence: Precedence, elapsed: Duration) {
        histogram!("tacedge_dispatch_latency_ms", elapsed.as_secs_f64() * 1000.0, "precedence" => precedence.as_str());
    }

    pub fn record_transient_failure(&self, precedence: Precedence) {
        self.counters
            .dispatch_transient_failures
            .fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_dispatch_transient_failures_total", 1, "precedence" => precedence.as_str());
    }

    pub fn record_permanent_failure(&self, precedence: Precedence) {
        self.counters
            .dispatch_permanent_failures
            .fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_dispatch_permanent_failures_total", 1, "precedence" => precedence.as_str());
        self.maybe_alert("dispatcher", HealthStatus::Warning, "permanent delivery failure");
    }

    pub fn record_expired(&self) {
        self.counters.expired_messages.fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_expired_messages_total", 1);
    }

    pub fn record_auth_failure(&self) {
        let count = self.counters.auth_failures.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("tacedge_auth_failures_total", 1);
        if count % self.alerts.auth_failure_burst_threshold == 0 {
            self.maybe_alert("gateway", HealthStatus::Warning, "auth failure burst detected");
        }
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
        counter!("tacedge_rate_limited_total", 1);
    }

    pub fn update_queue_depths(
        &self,
        depths: &HashMap<Precedence, usize>,
        watermarks: &crate::config::QueueWatermarks,
    ) {
        let snapshot = QueueSnapshot {
            flash: *depths.get(&Precedence::Flash).unwrap_or(&0),
            immediate: *depths.get(&Precedence::Immediate).unwrap_or(&0),
            priority: *depths.get(&Precedence::Priority).unwrap_or(&0),
            routine: *depths.get(&Precedence::Routine).unwrap_or(&0),
        };

        gauge!("tacedge_queue_depth", snapshot.flash as f64, "precedence" => "FLASH");
        gauge!("tacedge_queue_depth", snapshot.immediate as f64, "precedence" => "IMMEDIATE");
        gauge!("tacedge_queue_depth", snapshot.priority as f64, "precedence" => "PRIORITY");
        gauge!("tacedge_queue_depth", snapshot.routine as f64, "precedence" => "ROUTINE");

        for &p in &Precedence::ALL {
            let depth = *depths.get(&p).unwrap_or(&0);
            let watermark = watermarks.get(p);
            if watermark > 0 && depth as f64 / watermark as f64 >= self.alerts.queue_critical_fraction
            {
                self.maybe_alert(
                    "queue",
                    HealthStatus::Critical,
                    &format!("{p} queue at {depth}/{watermark}"),
                );
            }
        }

        *self.queue_depths.write() = snapshot;
    }

    pub fn update_node_counts(&self, connected: u32, total: u32) {
        *self.node_counts.write() = (connected, total);
        gauge!("tacedge_nodes_connected", connected as f64);
        gauge!("tacedge_nodes_total", total as f64);
    }

    fn maybe_alert(&self, component: &str, severity: HealthStatus, message: &str) {
        let now = Instant::now();
        let should_send = match self.last_alerts.get(component) {
            Some(last) if now.duration_since(*last) < self.alerts.alert_cooldown => false,
            _ => true,
        };
        if !should_send {
            return;
        }
        self.last_alerts.insert(component.to_string(), now);

        let _ = self.alert_sender.send(AlertEvent {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            component: component.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    pub fn get_system_health(&self) -> HealthStatus {
        let depths = self.queue_depths.read();
        let total = depths.flash + depths.immediate + depths.priority + depths.routine;
        let transient = self.counters.dispatch_transient_failures.load(Ordering::Relaxed);
        let permanent = self.counters.dispatch_permanent_failures.load(Ordering::Relaxed);

        if permanent > 0 && total > 50_000 {
            HealthStatus::Critical
        } else if transient > 100 {
            HealthStatus::Degraded
        } else if total > 10_000 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn get_current_metrics(&self) -> MetricsSnapshot {
        let (connected, total) = *self.node_counts.read();
        MetricsSnapshot {
            queue_depths: self.queue_depths.read().clone(),
            connected_nodes: connected,
            total_nodes: total,
            dispatch_attempts: self.counters.dispatch_attempts.load(Ordering::Relaxed),
            dispatch_successes: self.counters.dispatch_successes.load(Ordering::Relaxed),
            dispatch_transient_failures: self
                .counters
                .dispatch_transient_failures
                .load(Ordering::Relaxed),
            dispatch_permanent_failures: self
                .counters
                .dispatch_permanent_failures
                .load(Ordering::Relaxed),
            expired_messages: self.counters.expired_messages.load(Ordering::Relaxed),
            auth_failures: self.counters.auth_failures.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let monitor = ProductionMonitor::new(AlertConfig::default());
        assert_eq!(monitor.get_system_health(), HealthStatus::Healthy);
    }

    #[test]
    fn counters_increment() {
        let monitor = ProductionMonitor::new(AlertConfig::default());
        monitor.record_dispatch_attempt();
        monitor.record_dispatch_success(Precedence::Flash);
        let snapshot = monitor.get_current_metrics();
        assert_eq!(snapshot.dispatch_attempts, 1);
        assert_eq!(snapshot.dispatch_successes, 1);
    }
}
