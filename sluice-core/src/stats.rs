//! Per-connection statistics.
//!
//! Counters are lock-free atomics updated by the connection task and read
//! from anywhere through the shared [`ConnectionStats`] handle. The external
//! stats sink takes a [`StatsSnapshot`] and serializes it however it likes.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    connect_time_us: AtomicU64,
    last_connect_time_us: AtomicU64,
    writes_succeeded: AtomicU64,
    writes_failed: AtomicU64,
    writes_cancelled: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    responses: AtomicU64,
    probes_sent: AtomicU64,
    idle_timeouts: AtomicU64,
    transitions: AtomicU64,
    latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

#[inline]
fn micros(d: Duration) -> u64 {
    d.as_micros().min(u64::MAX as u128) as u64
}

impl ConnectionStats {
    /// Create zeroed stats.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connected(&self, took: Duration) {
        let us = micros(took);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.connect_time_us.fetch_add(us, Ordering::Relaxed);
        self.last_connect_time_us.store(us, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write_succeeded(&self, latency: Duration) {
        let us = micros(latency);
        self.writes_succeeded.fetch_add(1, Ordering::Relaxed);
        self.latency_us.fetch_add(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write_failed(&self) {
        self.writes_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write_cancelled(&self, count: u64) {
        self.writes_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_probe(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_idle_timeout(&self) {
        self.idle_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_transition(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Connect attempts started.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Successful connects.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Refused or timed-out connects.
    pub fn connect_failures(&self) -> u64 {
        self.connect_failures.load(Ordering::Relaxed)
    }

    /// Writes resolved as delivered.
    pub fn writes_succeeded(&self) -> u64 {
        self.writes_succeeded.load(Ordering::Relaxed)
    }

    /// Writes resolved as failed.
    pub fn writes_failed(&self) -> u64 {
        self.writes_failed.load(Ordering::Relaxed)
    }

    /// Writes resolved as cancelled by close.
    pub fn writes_cancelled(&self) -> u64 {
        self.writes_cancelled.load(Ordering::Relaxed)
    }

    /// Bytes written to the socket.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the socket.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Keep-alive probes sent.
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    /// Connections failed for idleness.
    pub fn idle_timeouts(&self) -> u64 {
        self.idle_timeouts.load(Ordering::Relaxed)
    }

    /// Status changes.
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts(),
            connects: self.connects(),
            connect_failures: self.connect_failures(),
            connect_time_us: self.connect_time_us.load(Ordering::Relaxed),
            last_connect_time_us: self.last_connect_time_us.load(Ordering::Relaxed),
            writes_succeeded: self.writes_succeeded(),
            writes_failed: self.writes_failed(),
            writes_cancelled: self.writes_cancelled(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            responses: self.responses.load(Ordering::Relaxed),
            probes_sent: self.probes_sent(),
            idle_timeouts: self.idle_timeouts(),
            transitions: self.transitions(),
            latency_us: self.latency_us.load(Ordering::Relaxed),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`ConnectionStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connect_attempts: u64,
    pub connects: u64,
    pub connect_failures: u64,
    /// Sum of time-to-connect, microseconds.
    pub connect_time_us: u64,
    pub last_connect_time_us: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    pub writes_cancelled: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub responses: u64,
    pub probes_sent: u64,
    pub idle_timeouts: u64,
    pub transitions: u64,
    /// Sum of request latency, microseconds.
    pub latency_us: u64,
    pub max_latency_us: u64,
}

impl StatsSnapshot {
    /// Mean latency of delivered writes.
    pub fn average_latency(&self) -> Option<Duration> {
        (self.writes_succeeded > 0)
            .then(|| Duration::from_micros(self.latency_us / self.writes_succeeded))
    }

    /// Mean time-to-connect.
    pub fn average_connect_time(&self) -> Option<Duration> {
        (self.connects > 0).then(|| Duration::from_micros(self.connect_time_us / self.connects))
    }

    /// Fraction of resolved writes that were delivered.
    pub fn success_rate(&self) -> f64 {
        let total = self.writes_succeeded + self.writes_failed;
        if total == 0 {
            return 1.0;
        }
        self.writes_succeeded as f64 / total as f64
    }

    /// Render as JSON for a stats sink.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counters() {
        let stats = ConnectionStats::new();
        stats.record_connect_attempt();
        stats.record_connected(Duration::from_millis(4));
        stats.record_sent(10);
        stats.record_received(6);
        stats.record_write_succeeded(Duration::from_millis(2));
        stats.record_write_succeeded(Duration::from_millis(6));
        stats.record_write_failed();
        stats.record_write_cancelled(3);

        assert_eq!(stats.connect_attempts(), 1);
        assert_eq!(stats.connects(), 1);
        assert_eq!(stats.bytes_sent(), 10);
        assert_eq!(stats.bytes_received(), 6);
        assert_eq!(stats.writes_succeeded(), 2);
        assert_eq!(stats.writes_failed(), 1);
        assert_eq!(stats.writes_cancelled(), 3);
    }

    #[test]
    fn test_snapshot_averages() {
        let stats = ConnectionStats::new();
        assert_eq!(stats.snapshot().average_latency(), None);
        assert_eq!(stats.snapshot().success_rate(), 1.0);

        stats.record_write_succeeded(Duration::from_millis(2));
        stats.record_write_succeeded(Duration::from_millis(6));
        stats.record_connected(Duration::from_millis(10));

        let snap = stats.snapshot();
        assert_eq!(snap.average_latency(), Some(Duration::from_millis(4)));
        assert_eq!(snap.max_latency_us, 6_000);
        assert_eq!(snap.average_connect_time(), Some(Duration::from_millis(10)));
        assert_eq!(snap.last_connect_time_us, 10_000);
    }

    #[test]
    fn test_snapshot_json() {
        let stats = ConnectionStats::new();
        stats.record_probe();
        stats.record_idle_timeout();
        let json = stats.snapshot().to_json().unwrap();
        assert!(json.contains("\"probes_sent\":1"));
        assert!(json.contains("\"idle_timeouts\":1"));
    }
}
