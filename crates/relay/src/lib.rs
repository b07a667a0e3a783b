//! Nostr relay
//!
//! WebSocket relay with SQLite persistence, NIP-42 client auth, NIP-45
//! counts, NIP-50 search, NIP-77 set reconciliation and NIP-86 management
//! RPC. Storage backends are pluggable through a driver registry; the
//! bundled driver is SQLite.

pub mod admin;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod rate_limit;
pub mod relay_info;
pub mod server;
pub mod staging;
pub mod storage;
pub mod store_sqlite;
pub mod subscription;

pub use config::{AuthMode, Config};
pub use error::{RelayError, Result};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use policy::{AdminPolicy, Decision, IngestionPolicy};
pub use server::RelayServer;
pub use storage::{PutOutcome, QueryHandle, Storage, create_driver, register_driver};
pub use store_sqlite::SqliteStore;

use std::sync::Arc;

/// Register the bundled storage drivers. Idempotent.
pub fn register_builtin_drivers() {
    storage::register_driver(
        "sqlite",
        Arc::new(|uri| {
            let store = store_sqlite::SqliteStore::open(uri)?;
            Ok(Arc::new(store) as Arc<dyn Storage>)
        }),
    );
}
