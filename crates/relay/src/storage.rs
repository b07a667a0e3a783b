//! Storage driver contract
//!
//! Backends are registered by name in a process-wide registry and created
//! from a driver-specific URI. Query results are snapshots: a
//! [`QueryHandle`] owns the full result set at creation time, so writes
//! landing after the query never appear in an open handle.

use crate::error::{RelayError, Result};
use nostr_core::nip77::ReconciliationState;
use nostr_core::{Event, Filter};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

/// Outcome of a `put_event` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New row inserted.
    Stored,
    /// Replaceable kind: existing row deleted, new row inserted.
    Replaced,
    /// Same id already present; write skipped.
    Duplicate,
    /// Replaceable kind lost to an existing newer (or equal-age) event.
    Superseded,
    /// Ephemeral kind; accepted but never stored.
    Ephemeral,
}

impl PutOutcome {
    /// Whether the event landed in storage and should reach subscribers.
    pub fn is_written(self) -> bool {
        matches!(self, PutOutcome::Stored | PutOutcome::Replaced)
    }
}

/// Snapshot of query results, drained in batches by the dispatcher.
pub struct QueryHandle {
    events: VecDeque<Event>,
}

impl QueryHandle {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into(),
        }
    }

    /// Take up to `max` events; an empty result means exhausted.
    pub fn next_batch(&mut self, max: usize) -> Vec<Event> {
        let take = max.min(self.events.len());
        self.events.drain(..take).collect()
    }

    pub fn is_exhausted(&self) -> bool {
        self.events.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

/// Post-commit notification carrying a backend-opaque key.
pub type NotifyFn = Arc<dyn Fn(u64) + Send + Sync>;

pub trait Storage: Send + Sync {
    /// Release backend resources. Dropping the handle must be equivalent.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn put_event(&self, event: &Event) -> Result<PutOutcome>;

    /// Variant tagging the source relay for provenance.
    fn put_event_with_relay(&self, event: &Event, _relay_url: &str) -> Result<PutOutcome> {
        self.put_event(event)
    }

    /// Optional; drivers without deletion report unsupported.
    fn delete_event(&self, _id_hex: &str) -> Result<bool> {
        Err(RelayError::Storage("delete unsupported".to_string()))
    }

    fn query(&self, filters: &[Filter], limit: usize) -> Result<QueryHandle>;

    fn count(&self, filters: &[Filter]) -> Result<u64>;

    /// NIP-50 full-text search; `Ok(None)` means unsupported.
    fn search(&self, _query: &str, _scope: &Filter, _limit: usize) -> Result<Option<QueryHandle>> {
        Ok(None)
    }

    /// NIP-77 digest over the scoped event set; `Ok(None)` means
    /// unsupported. Reconciliation and release happen on the returned
    /// state itself.
    fn set_digest(&self, _scope: &Filter) -> Result<Option<ReconciliationState>> {
        Ok(None)
    }

    /// One-shot registration for post-commit notifications.
    fn notify_callback(&self, callback: NotifyFn);

    /// Dereference a backend key delivered through the notify path.
    fn get_by_key(&self, key: u64) -> Result<Option<Event>>;
}

pub type StorageFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Storage>> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, StorageFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, StorageFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a driver factory. Re-registering a name replaces the previous
/// factory.
pub fn register_driver(name: &str, factory: StorageFactory) {
    if let Ok(mut map) = registry().lock() {
        map.insert(name.to_string(), factory);
    }
}

/// Create a storage handle by driver name, or `None` if unregistered.
pub fn create_driver(name: &str, uri: &str) -> Option<Result<Arc<dyn Storage>>> {
    let factory = registry().lock().ok()?.get(name).cloned()?;
    Some(factory(uri))
}
