//! Client authentication (NIP-42)
//!
//! The server hands each connection a random challenge in an
//! `["AUTH", challenge]` frame; the client answers with a signed
//! kind-22242 event carrying the challenge in a tag.

use crate::event::{Event, EventTemplate, KIND_CLIENT_AUTH, finalize_event};
use rand::RngCore;
use thiserror::Error;

/// Accepted clock skew for the auth event's created_at, in seconds.
pub const AUTH_TIMESTAMP_WINDOW: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("wrong kind: expected {KIND_CLIENT_AUTH}, got {0}")]
    WrongKind(u32),

    #[error("missing challenge tag")]
    MissingChallenge,

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("invalid signature")]
    BadSignature,

    #[error("created_at outside the accepted window")]
    TimestampOutOfRange,
}

/// Generate a random 16-byte hex challenge.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Validate a client AUTH event against the per-connection challenge.
///
/// Returns the authenticated pubkey on success.
pub fn validate_auth_event(
    event: &Event,
    expected_challenge: &str,
    now: i64,
) -> Result<String, AuthError> {
    if event.kind != KIND_CLIENT_AUTH {
        return Err(AuthError::WrongKind(event.kind));
    }

    let challenge = event
        .tag_value("challenge")
        .ok_or(AuthError::MissingChallenge)?;
    if challenge != expected_challenge {
        return Err(AuthError::ChallengeMismatch);
    }

    // saturating: a hostile created_at near i64::MIN must not overflow
    if event.created_at.saturating_sub(now).saturating_abs() > AUTH_TIMESTAMP_WINDOW {
        return Err(AuthError::TimestampOutOfRange);
    }

    match event.verify() {
        Ok(true) => Ok(event.pubkey.clone()),
        _ => Err(AuthError::BadSignature),
    }
}

/// Build a signed AUTH response event for a given challenge and relay URL.
pub fn build_auth_event(
    challenge: &str,
    relay_url: &str,
    secret_key: &[u8; 32],
    created_at: i64,
) -> Result<Event, crate::event::EventError> {
    let template = EventTemplate {
        kind: KIND_CLIENT_AUTH,
        created_at,
        tags: vec![
            vec!["relay".to_string(), relay_url.to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
    };
    finalize_event(&template, secret_key)
}
