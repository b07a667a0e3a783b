//! Live event fan-out
//!
//! Committed writes are published on a tokio broadcast channel; each
//! connection task filters them against its own subscriptions. A bounded
//! per-subscription dedup set suppresses repeat deliveries of the same
//! backend key.

use nostr_core::Event;
use std::collections::HashSet;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

/// Number of remembered keys before the dedup set resets. Duplicates past
/// the reset are harmless; downstream consumers dedup again.
const DEDUP_CLEAR_THRESHOLD: usize = 4096;

#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Backend key assigned at commit time.
    pub key: u64,
    pub event: Event,
}

pub fn create_broadcast_channel() -> (
    broadcast::Sender<BroadcastEvent>,
    broadcast::Receiver<BroadcastEvent>,
) {
    broadcast::channel(BROADCAST_CAPACITY)
}

/// Bounded set of recently delivered backend keys.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashSet<u64>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `key` has not been delivered within the current
    /// set lifetime, and records it.
    pub fn first_delivery(&mut self, key: u64) -> bool {
        if self.seen.len() > DEDUP_CLEAR_THRESHOLD {
            self.seen.clear();
        }
        self.seen.insert(key)
    }
}
