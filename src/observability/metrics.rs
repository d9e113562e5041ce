//! Thread-safe metrics collection
//!
//! Atomic counters for scheduler and transport events plus a bounded window of
//! task latencies. One collector is owned by each `Federation` and shared with
//! the transport and the stats server through an `Arc`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Latency samples kept for percentile calculation
const LATENCY_WINDOW: usize = 1000;

/// Thread-safe metrics collector using atomics and a mutex-protected window
#[derive(Debug)]
pub struct MetricsCollector {
    // Scheduler
    tasks_submitted: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed_permanent: AtomicU64,
    retries: AtomicU64,
    fallbacks_used: AtomicU64,
    health_reassignments: AtomicU64,
    timeouts: AtomicU64,
    results_discarded: AtomicU64,
    persistence_failures: AtomicU64,

    // Transport
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,

    latencies: Mutex<Vec<u64>>,
    started_at: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_dispatched: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed_permanent: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            fallbacks_used: AtomicU64::new(0),
            health_reassignments: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            results_discarded: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Scheduler metrics
    pub fn task_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_succeeded(&self, latency: Duration) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn task_failed_permanent(&self) {
        self.tasks_failed_permanent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback_used(&self) {
        self.fallbacks_used.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_reassigned(&self) {
        self.health_reassignments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_discarded(&self) {
        self.results_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let mut times = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        times.push(latency.as_millis() as u64);
        if times.len() > LATENCY_WINDOW {
            times.remove(0);
        }
    }

    // Transport metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency average and percentiles over the window (pure function)
    fn latency_statistics(&self) -> (f64, f64, f64, f64) {
        let times = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let mut sorted = times.clone();
        drop(times);
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_latency_ms, p50, p95, p99) = self.latency_statistics();

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            scheduler: SchedulerMetrics {
                tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
                tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
                tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
                tasks_failed_permanent: self.tasks_failed_permanent.load(Ordering::Relaxed),
                retries: self.retries.load(Ordering::Relaxed),
                fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
                health_reassignments: self.health_reassignments.load(Ordering::Relaxed),
                timeouts: self.timeouts.load(Ordering::Relaxed),
                results_discarded: self.results_discarded.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
                avg_latency_ms,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
            },
            transport: TransportMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub scheduler: SchedulerMetrics,
    pub transport: TransportMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed_permanent: u64,
    pub retries: u64,
    pub fallbacks_used: u64,
    pub health_reassignments: u64,
    pub timeouts: u64,
    pub results_discarded: u64,
    pub persistence_failures: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_independent_per_instance() {
        let a = MetricsCollector::new();
        let b = MetricsCollector::new();

        a.task_submitted();
        a.task_submitted();
        a.task_retried();
        b.task_submitted();

        assert_eq!(a.snapshot().scheduler.tasks_submitted, 2);
        assert_eq!(a.snapshot().scheduler.retries, 1);
        assert_eq!(b.snapshot().scheduler.tasks_submitted, 1);
        assert_eq!(b.snapshot().scheduler.retries, 0);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = MetricsCollector::new();
        for ms in [10, 20, 30, 40, 50] {
            metrics.task_succeeded(Duration::from_millis(ms));
        }

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.scheduler.tasks_succeeded, 5);
        assert_eq!(snapshot.scheduler.avg_latency_ms, 30.0);
        assert_eq!(snapshot.scheduler.latency_p50_ms, 30.0);
        assert!((snapshot.scheduler.latency_p95_ms - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = MetricsCollector::new();
        for _ in 0..(LATENCY_WINDOW + 10) {
            metrics.task_succeeded(Duration::from_millis(1));
        }
        assert_eq!(metrics.latencies.lock().unwrap().len(), LATENCY_WINDOW);
    }

    #[test]
    fn test_connection_state_tracking() {
        let metrics = MetricsCollector::new();
        metrics.mqtt_connection_attempt();
        metrics.mqtt_connection_established();
        assert!(metrics.snapshot().transport.connected);

        metrics.mqtt_connection_lost();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.transport.connected);
        assert_eq!(snapshot.transport.connection_attempts, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert_eq!(json["scheduler"]["tasks_submitted"], 0);
        assert_eq!(json["transport"]["connected"], false);
    }

    #[test]
    fn test_percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[7], 99.0), 7.0);
    }
}
