//! Relay counters
//!
//! Lock-free atomic counters shared across connection tasks. A snapshot
//! feeds the admin `getstats` and `getconnections` methods.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct RelayMetrics {
    start_time: Instant,

    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_blocked: AtomicU64,

    pub events_received: AtomicU64,
    pub events_stored: AtomicU64,
    pub events_duplicate: AtomicU64,
    pub events_rejected: AtomicU64,

    pub subscriptions_opened: AtomicU64,
    pub subscriptions_closed: AtomicU64,

    pub queries_executed: AtomicU64,
    pub store_errors: AtomicU64,

    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_blocked: u64,
    pub connections_active: u64,
    pub events_received: u64,
    pub events_stored: u64,
    pub events_duplicate: u64,
    pub events_rejected: u64,
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
    pub subscriptions_active: u64,
    pub queries_executed: u64,
    pub store_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_blocked: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            events_stored: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            subscriptions_opened: AtomicU64::new(0),
            subscriptions_closed: AtomicU64::new(0),
            queries_executed: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        opened.saturating_sub(closed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        let subs_opened = self.subscriptions_opened.load(Ordering::Relaxed);
        let subs_closed = self.subscriptions_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            connections_opened: opened,
            connections_closed: closed,
            connections_blocked: self.connections_blocked.load(Ordering::Relaxed),
            connections_active: opened.saturating_sub(closed),
            events_received: self.events_received.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            subscriptions_opened: subs_opened,
            subscriptions_closed: subs_closed,
            subscriptions_active: subs_opened.saturating_sub(subs_closed),
            queries_executed: self.queries_executed.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RelayMetrics::new();
        RelayMetrics::incr(&metrics.events_received);
        RelayMetrics::incr(&metrics.events_received);
        RelayMetrics::add(&metrics.bytes_in, 512);

        let snap = metrics.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.bytes_in, 512);
        assert_eq!(snap.events_stored, 0);
    }

    #[test]
    fn test_active_connections_never_underflows() {
        let metrics = RelayMetrics::new();
        RelayMetrics::incr(&metrics.connections_closed);
        assert_eq!(metrics.active_connections(), 0);

        RelayMetrics::incr(&metrics.connections_opened);
        RelayMetrics::incr(&metrics.connections_opened);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RelayMetrics::new();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert!(json.get("uptime_seconds").is_some());
        assert!(json.get("connections_active").is_some());
    }
}
