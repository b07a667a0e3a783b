//! Ingestion policy
//!
//! `decide` runs every inbound EVENT through structure validation, clock
//! skew bounds, signature verification, the replay cache, and the admin
//! policy document, producing a store/accept/reject decision with a stable
//! reason string.

use crate::error::Result;
use nostr_core::{Event, validate_event_structure, verify_event};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Stable reason strings for `OK` and `CLOSED` frames. Clients match on
/// the category prefix before any human text.
pub mod reason {
    pub const OK: &str = "";
    pub const DUPLICATE: &str = "duplicate";
    pub const BAD_EVENT: &str = "invalid: bad event";
    pub const BAD_SIGNATURE: &str = "invalid: bad signature";
    pub const CREATED_AT_OUT_OF_RANGE: &str = "invalid: created_at out of range";
    pub const BAD_FILTER: &str = "invalid: bad filter";
    pub const AUTH_REQUIRED: &str = "auth-required";
    pub const AUTH_PUBKEY_MISMATCH: &str = "auth-pubkey-mismatch";
    pub const RATE_LIMITED: &str = "rate-limited";
    pub const TOO_MANY_SUBS: &str = "too-many-subs";
    pub const STORE_FAILED: &str = "error: store failed";
    pub const STORE_UNAVAILABLE: &str = "error: store-unavailable";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const UNSUPPORTED_SEARCH: &str = "unsupported: search";
    pub const COUNT_FAILED: &str = "count-failed";
    pub const NEGENTROPY_DISABLED: &str = "error: negentropy disabled";
    pub const NEGENTROPY_NOT_IMPLEMENTED: &str = "error: negentropy not implemented";
    pub const MALFORMED_FRAME: &str = "malformed: frame";
    pub const BANNED_PUBKEY: &str = "blocked: pubkey is banned";
    pub const PUBKEY_NOT_ALLOWED: &str = "blocked: pubkey not in allowlist";
    pub const KIND_NOT_ALLOWED: &str = "blocked: kind not allowed";
    pub const BANNED_EVENT: &str = "blocked: event is banned";
}

/// Outcome of running an event through the ingestion policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Store,
    /// Accept with OK(true) but skip storage.
    AcceptNoStore(&'static str),
    Reject(&'static str),
}

const REPLAY_SLOTS: usize = 65_536;
const REPLAY_PROBE_DEPTH: usize = 1_024;

/// Fixed-size ring of recently seen event ids. Probes scan backwards from
/// the newest entry, bounded by [`REPLAY_PROBE_DEPTH`]; entries older than
/// the TTL are ignored. TTL 0 disables suppression entirely.
pub struct ReplayCache {
    slots: Vec<Option<([u8; 32], u64)>>,
    head: usize,
    ttl_seconds: u64,
}

impl ReplayCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            slots: vec![None; REPLAY_SLOTS],
            head: 0,
            ttl_seconds,
        }
    }

    /// Returns true when `id` was seen within the TTL; records it either
    /// way.
    pub fn check_and_insert(&mut self, id_hex: &str, now: u64) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let Ok(bytes) = hex::decode(id_hex) else {
            return false;
        };
        if bytes.len() != 32 {
            return false;
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(&bytes);

        for back in 1..=REPLAY_PROBE_DEPTH {
            let idx = (self.head + REPLAY_SLOTS - back) % REPLAY_SLOTS;
            match self.slots[idx] {
                Some((slot_id, seen_at)) if slot_id == id => {
                    if now.saturating_sub(seen_at) <= self.ttl_seconds {
                        return true;
                    }
                    break;
                }
                _ => {}
            }
        }

        self.slots[self.head] = Some((id, now));
        self.head = (self.head + 1) % REPLAY_SLOTS;
        false
    }
}

/// Mutable relay policy, persisted as canonical JSON. Mutations rewrite
/// the file atomically via a temp file and rename.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminPolicy {
    pub banned_pubkeys: BTreeSet<String>,
    pub allowed_pubkeys: BTreeSet<String>,
    pub banned_events: BTreeSet<String>,
    pub allowed_kinds: BTreeSet<u32>,
    pub blocked_ips: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_icon: Option<String>,
}

impl AdminPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp: PathBuf = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "policy persisted");
        Ok(())
    }

    /// Policy verdict for an event; `None` means no objection.
    pub fn check_event(&self, event: &Event) -> Option<&'static str> {
        if self.banned_pubkeys.contains(&event.pubkey) {
            return Some(reason::BANNED_PUBKEY);
        }
        if !self.allowed_pubkeys.is_empty() && !self.allowed_pubkeys.contains(&event.pubkey) {
            return Some(reason::PUBKEY_NOT_ALLOWED);
        }
        if !self.allowed_kinds.is_empty() && !self.allowed_kinds.contains(&event.kind) {
            return Some(reason::KIND_NOT_ALLOWED);
        }
        if self.banned_events.contains(&event.id) {
            return Some(reason::BANNED_EVENT);
        }
        None
    }

    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        self.blocked_ips.contains(ip)
    }
}

/// Ingestion policy engine. Owns the replay cache; the admin policy is
/// passed per call so HTTP mutations are observed as a snapshot.
pub struct IngestionPolicy {
    skew_future_seconds: u64,
    skew_past_seconds: u64,
    auth_required: bool,
    replay: ReplayCache,
}

impl IngestionPolicy {
    pub fn new(
        skew_future_seconds: u64,
        skew_past_seconds: u64,
        replay_ttl_seconds: u64,
        auth_required: bool,
    ) -> Self {
        Self {
            skew_future_seconds,
            skew_past_seconds,
            auth_required,
            replay: ReplayCache::new(replay_ttl_seconds),
        }
    }

    pub fn decide(
        &mut self,
        event: &Event,
        now: i64,
        authenticated_pubkey: Option<&str>,
        admin: &AdminPolicy,
    ) -> Decision {
        if !validate_event_structure(event) {
            return Decision::Reject(reason::BAD_EVENT);
        }

        if self.skew_future_seconds > 0 && event.created_at > now + self.skew_future_seconds as i64
        {
            return Decision::Reject(reason::CREATED_AT_OUT_OF_RANGE);
        }
        if self.skew_past_seconds > 0 && event.created_at < now - self.skew_past_seconds as i64 {
            return Decision::Reject(reason::CREATED_AT_OUT_OF_RANGE);
        }

        match verify_event(event) {
            Ok(true) => {}
            Ok(false) | Err(_) => return Decision::Reject(reason::BAD_SIGNATURE),
        }

        // auth runs before the replay probe so a rejected submission does
        // not mark the id as seen
        if self.auth_required {
            match authenticated_pubkey {
                None => return Decision::Reject(reason::AUTH_REQUIRED),
                Some(pk) if pk != event.pubkey => {
                    warn!(event = %event.id, "auth pubkey mismatch");
                    return Decision::Reject(reason::AUTH_PUBKEY_MISMATCH);
                }
                Some(_) => {}
            }
        }

        if self.replay.check_and_insert(&event.id, now.max(0) as u64) {
            return Decision::AcceptNoStore(reason::DUPLICATE);
        }

        if let Some(objection) = admin.check_event(event) {
            return Decision::Reject(objection);
        }

        Decision::Store
    }
}
