//! Nostr protocol core.
//!
//! This crate provides:
//! - NIP-01: Events, canonical serialization, signing, verification
//! - NIP-01: Filters and subscription matching
//! - Client/relay wire frames (`EVENT`, `REQ`, `OK`, `EOSE`, `CLOSED`, ...)
//! - NIP-04: Encrypted Direct Messages (share transport)
//! - NIP-06: Key derivation from BIP39 mnemonic seed phrases
//! - NIP-42: Authentication of Clients to Relays
//! - NIP-49: Private Key Encryption (`ncryptsec`)
//! - NIP-77: Negentropy set reconciliation primitives
//! - NIP-98: HTTP Auth (signed request headers)
//! - Shamir secret sharing over GF(2^8) for social recovery
//! - Guardian-based recovery configuration and share transport
//! - Encrypted key backup documents

pub mod backup;
pub mod event;
pub mod filter;
pub mod nip04;
pub mod nip06;
pub mod nip42;
pub mod nip49;
pub mod nip77;
pub mod nip98;
pub mod recovery;
pub mod shamir;
pub mod wire;

// NIP-01: event model
pub use event::{
    ADDRESSABLE_KIND_MAX, ADDRESSABLE_KIND_MIN, EPHEMERAL_KIND_MAX, EPHEMERAL_KIND_MIN, Event,
    EventError, EventTemplate, KIND_CHANNEL_METADATA, KIND_CLIENT_AUTH, KIND_CONTACTS,
    KIND_METADATA, KIND_SHORT_TEXT_NOTE, KindClassification, UnsignedEvent, canonical_serialization,
    classify_kind, finalize_event, generate_secret_key, get_event_hash, get_public_key,
    get_public_key_hex, is_addressable_kind, is_ephemeral_kind, is_replaceable_kind, sort_events,
    validate_event_structure, validate_unsigned_event, verify_event,
};

// NIP-01: filters
pub use filter::{Filter, FilterError, matches_any};

// Wire frames
pub use wire::{ClientFrame, WireError, parse_client_frame, parse_client_value};
