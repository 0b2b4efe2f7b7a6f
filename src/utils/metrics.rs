//! Observability and Metrics
//!
//! Process-wide counters describing connection churn, handshakes, traffic,
//! callback outcomes and faults.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Total connections that completed initialisation
    pub connections_total: AtomicU64,
    /// Currently live connections
    pub connections_active: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Callbacks registered
    pub callbacks_registered: AtomicU64,
    /// Callbacks resolved with a response
    pub callbacks_answered: AtomicU64,
    /// Callbacks resolved by timeout
    pub callbacks_timed_out: AtomicU64,
    /// Callbacks resolved by connection loss
    pub callbacks_lost: AtomicU64,
    /// Peers rejected by a validator
    pub validation_rejections: AtomicU64,
    /// Transport faults (send/receive/accept/connect)
    pub transport_faults: AtomicU64,
    /// Framing errors
    pub framing_errors: AtomicU64,
    /// Instability counter saturations
    pub saturations: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            callbacks_registered: AtomicU64::new(0),
            callbacks_answered: AtomicU64::new(0),
            callbacks_timed_out: AtomicU64::new(0),
            callbacks_lost: AtomicU64::new(0),
            validation_rejections: AtomicU64::new(0),
            transport_faults: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            saturations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a connection that finished initialisation
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an initialised connection being disposed
    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Record a handshake attempt
    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful handshake
    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed handshake
    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message sent
    pub fn message_sent(&self, byte_count: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record bytes received from a transport
    pub fn bytes_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a decoded incoming message
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_registered(&self) {
        self.callbacks_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_answered(&self) {
        self.callbacks_answered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_timed_out(&self) {
        self.callbacks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_lost(&self) {
        self.callbacks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_rejected(&self) {
        self.validation_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_fault(&self) {
        self.transport_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn saturation(&self) {
        self.saturations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            callbacks_registered: self.callbacks_registered.load(Ordering::Relaxed),
            callbacks_answered: self.callbacks_answered.load(Ordering::Relaxed),
            callbacks_timed_out: self.callbacks_timed_out.load(Ordering::Relaxed),
            callbacks_lost: self.callbacks_lost.load(Ordering::Relaxed),
            validation_rejections: self.validation_rejections.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            saturations: self.saturations.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            callbacks_registered = snapshot.callbacks_registered,
            callbacks_answered = snapshot.callbacks_answered,
            callbacks_timed_out = snapshot.callbacks_timed_out,
            callbacks_lost = snapshot.callbacks_lost,
            validation_rejections = snapshot.validation_rejections,
            transport_faults = snapshot.transport_faults,
            framing_errors = snapshot.framing_errors,
            saturations = snapshot.saturations,
            uptime_seconds = snapshot.uptime_seconds,
            "Metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub callbacks_registered: u64,
    pub callbacks_answered: u64,
    pub callbacks_timed_out: u64,
    pub callbacks_lost: u64,
    pub validation_rejections: u64,
    pub transport_faults: u64,
    pub framing_errors: u64,
    pub saturations: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_connections_never_underflow() {
        let metrics = Metrics::new();
        metrics.connection_closed();
        assert_eq!(metrics.snapshot().connections_active, 0);

        metrics.connection_established();
        metrics.connection_established();
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 2);
        assert_eq!(snapshot.connections_active, 1);
    }

    #[test]
    fn test_traffic_counters() {
        let metrics = Metrics::new();
        metrics.message_sent(10);
        metrics.message_sent(5);
        metrics.bytes_received(7);
        metrics.message_received();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.bytes_received, 7);
        assert_eq!(snapshot.messages_received, 1);
    }
}
