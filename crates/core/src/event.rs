//! Core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization for hashing
//! - Event signing and verification with Schnorr signatures
//! - Kind classification (regular, replaceable, ephemeral, addressable)

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{schnorr, Message, SecretKey, XOnlyPublicKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building or checking events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the canonical serialization
    pub id: String,
    /// 32-bytes lowercase hex-encoded x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: i64,
    /// Event kind
    pub kind: u32,
    /// Array of arrays of strings; first element of each tag is its key
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex Schnorr signature over the id
    pub sig: String,
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey is derived from the signing
/// key, so templates don't carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Event kind classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClassification {
    /// Independently addressable; every event is stored
    Regular,
    /// Only the latest event per (pubkey, kind) is stored
    Replaceable,
    /// Not persisted; delivered to live subscriptions only
    Ephemeral,
    /// Only the latest event per (pubkey, kind, d-tag) is stored
    Addressable,
}

// Standard event kinds
pub const KIND_METADATA: u32 = 0;
pub const KIND_SHORT_TEXT_NOTE: u32 = 1;
pub const KIND_CONTACTS: u32 = 3;
pub const KIND_CHANNEL_METADATA: u32 = 41;
pub const KIND_CLIENT_AUTH: u32 = 22242;

pub const EPHEMERAL_KIND_MIN: u32 = 20000;
pub const EPHEMERAL_KIND_MAX: u32 = 29999;
pub const ADDRESSABLE_KIND_MIN: u32 = 30000;
pub const ADDRESSABLE_KIND_MAX: u32 = 39999;

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key (32 bytes) from a secret key.
pub fn get_public_key(secret_key: &[u8; 32]) -> Result<[u8; 32], EventError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(xonly.serialize())
}

/// Get the public key as a hex string from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    Ok(hex::encode(get_public_key(secret_key)?))
}

/// Serialize an unsigned event into its canonical signing form.
///
/// Format: `[0, pubkey, created_at, kind, tags, content]` with no
/// insignificant whitespace. This is the byte sequence hashed to form `id`.
pub fn canonical_serialization(event: &UnsignedEvent) -> Result<String, EventError> {
    if !validate_unsigned_event(event) {
        return Err(EventError::InvalidEvent(
            "can't serialize event with wrong or missing properties".to_string(),
        ));
    }

    let serialized = serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))?;

    Ok(serialized)
}

/// Get the event hash (id) from an unsigned event.
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = canonical_serialization(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Validate an unsigned event structure.
pub fn validate_unsigned_event(event: &UnsignedEvent) -> bool {
    if event.pubkey.len() != 64 {
        return false;
    }
    if !event.pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey != event.pubkey.to_lowercase() {
        return false;
    }
    true
}

/// Validate a signed event structure (not including signature verification).
pub fn validate_event_structure(event: &Event) -> bool {
    if event.id.len() != 64 || !event.id.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey.len() != 64 || !event.pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    if event.pubkey != event.pubkey.to_lowercase() {
        return false;
    }
    if event.sig.len() != 128 || !event.sig.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    true
}

impl Event {
    /// The canonical byte sequence hashed to form `id`.
    pub fn canonical(&self) -> Result<String, EventError> {
        canonical_serialization(&self.unsigned())
    }

    /// True iff `sig` verifies `id` under `pubkey` and `id` matches the
    /// canonical hash.
    pub fn verify(&self) -> Result<bool, EventError> {
        verify_event(self)
    }

    /// First value of the `d` tag, if present (empty string counts).
    pub fn d_tag(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// First value of a named tag, if present.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == key)
            .map(|t| t[1].as_str())
    }

    fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, EventError> {
    let secp = Secp256k1::new();

    let sk = SecretKey::from_slice(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;
    let (xonly_pk, _parity) = sk.x_only_public_key(&secp);
    let pubkey = hex::encode(xonly_pk.serialize());

    let unsigned = UnsignedEvent {
        pubkey: pubkey.clone(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };

    let id = get_event_hash(&unsigned)?;

    let id_bytes =
        hex::decode(&id).map_err(|e| EventError::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Signing(format!("invalid message: {}", e)))?;

    let keypair = bitcoin::secp256k1::Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);
    let sig_hex = hex::encode(sig.serialize());

    Ok(Event {
        id,
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: sig_hex,
    })
}

/// Verify an event's signature and id.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    if !validate_event_structure(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };

    let computed_id = get_event_hash(&unsigned)?;
    if computed_id != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();

    let id_bytes = hex::decode(&event.id)
        .map_err(|e| EventError::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| EventError::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::Verification(format!("invalid signature: {}", e)))?;

    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::Verification(format!("invalid pubkey: {}", e)))?;

    match secp.verify_schnorr(&sig, &message, &pubkey) {
        Ok(()) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// Classify an event kind.
///
/// Replaceable kinds are 0, 3 and 41; addressable kinds carry a `d` tag and
/// occupy 30000-39999; ephemeral kinds occupy 20000-29999. Everything else
/// is regular.
pub fn classify_kind(kind: u32) -> KindClassification {
    match kind {
        KIND_METADATA | KIND_CONTACTS | KIND_CHANNEL_METADATA => KindClassification::Replaceable,
        EPHEMERAL_KIND_MIN..=EPHEMERAL_KIND_MAX => KindClassification::Ephemeral,
        ADDRESSABLE_KIND_MIN..=ADDRESSABLE_KIND_MAX => KindClassification::Addressable,
        _ => KindClassification::Regular,
    }
}

pub fn is_replaceable_kind(kind: u32) -> bool {
    matches!(classify_kind(kind), KindClassification::Replaceable)
}

pub fn is_ephemeral_kind(kind: u32) -> bool {
    matches!(classify_kind(kind), KindClassification::Ephemeral)
}

pub fn is_addressable_kind(kind: u32) -> bool {
    matches!(classify_kind(kind), KindClassification::Addressable)
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}
