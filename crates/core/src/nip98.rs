//! HTTP authorization (NIP-98)
//!
//! Signed kind-27235 events carried in an `Authorization: Nostr <base64>`
//! header prove who is making an HTTP request. The event pins the absolute
//! URL, the HTTP method and optionally a SHA-256 of the request body.

use crate::event::{Event, EventTemplate, finalize_event};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Event kind for HTTP auth (a nod to RFC 7235)
pub const KIND_HTTP_AUTH: u32 = 27235;

/// Header scheme
pub const AUTH_SCHEME: &str = "Nostr";

/// Accepted clock skew in seconds, either direction
pub const DEFAULT_TIMESTAMP_WINDOW: i64 = 60;

#[derive(Debug, Error)]
pub enum Nip98Error {
    #[error("invalid event kind: expected {KIND_HTTP_AUTH}, got {0}")]
    WrongKind(u32),

    #[error("invalid signature")]
    BadSignature,

    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("created_at outside the accepted window")]
    TimestampOutOfWindow,

    #[error("url mismatch: expected {expected}, got {actual}")]
    UrlMismatch { expected: String, actual: String },

    #[error("method mismatch: expected {expected}, got {actual}")]
    MethodMismatch { expected: String, actual: String },

    #[error("payload hash mismatch")]
    PayloadHashMismatch,

    #[error("unknown HTTP method: {0}")]
    UnknownMethod(String),

    #[error("invalid authorization header: {0}")]
    BadHeader(String),

    #[error(transparent)]
    Event(#[from] crate::event::EventError),
}

/// HTTP method carried in the `method` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Result<Self, Nip98Error> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(Nip98Error::UnknownMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// The request binding extracted from (or written into) the event tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuth {
    /// Absolute URL including query string
    pub url: String,
    pub method: HttpMethod,
    /// Hex SHA-256 of the request body, when the request carries one
    pub payload_hash: Option<String>,
}

impl HttpAuth {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            payload_hash: None,
        }
    }

    pub fn with_payload_hash(mut self, hash: impl Into<String>) -> Self {
        self.payload_hash = Some(hash.into());
        self
    }

    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = vec![
            vec!["u".to_string(), self.url.clone()],
            vec!["method".to_string(), self.method.as_str().to_string()],
        ];
        if let Some(ref hash) = self.payload_hash {
            tags.push(vec!["payload".to_string(), hash.clone()]);
        }
        tags
    }

    pub fn from_event(event: &Event) -> Result<Self, Nip98Error> {
        let url = event
            .tag_value("u")
            .ok_or(Nip98Error::MissingTag("u"))?
            .to_string();
        let method = HttpMethod::parse(
            event
                .tag_value("method")
                .ok_or(Nip98Error::MissingTag("method"))?,
        )?;
        let payload_hash = event.tag_value("payload").map(str::to_string);

        Ok(Self {
            url,
            method,
            payload_hash,
        })
    }
}

/// Hex SHA-256 of a request body.
pub fn hash_payload(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Sign a kind-27235 event binding a request, for use as a header value.
pub fn build_auth_event(
    auth: &HttpAuth,
    secret_key: &[u8; 32],
    created_at: i64,
) -> Result<Event, Nip98Error> {
    let template = EventTemplate {
        kind: KIND_HTTP_AUTH,
        created_at,
        tags: auth.to_tags(),
        content: String::new(),
    };
    Ok(finalize_event(&template, secret_key)?)
}

/// Format an Authorization header from a signed auth event.
pub fn encode_authorization_header(event: &Event) -> Result<String, Nip98Error> {
    let json = serde_json::to_string(event)
        .map_err(|e| Nip98Error::BadHeader(e.to_string()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(json.as_bytes());
    Ok(format!("{} {}", AUTH_SCHEME, encoded))
}

/// Extract the signed event from an `Authorization: Nostr <base64>` header.
/// Both standard and url-safe base64 alphabets are accepted.
pub fn decode_authorization_header(header: &str) -> Result<Event, Nip98Error> {
    let mut parts = header.split_whitespace();
    let scheme = parts
        .next()
        .ok_or_else(|| Nip98Error::BadHeader("empty header".to_string()))?;
    if scheme != AUTH_SCHEME {
        return Err(Nip98Error::BadHeader(format!(
            "expected scheme '{}', got '{}'",
            AUTH_SCHEME, scheme
        )));
    }
    let payload = parts
        .next()
        .ok_or_else(|| Nip98Error::BadHeader("missing event payload".to_string()))?;
    if parts.next().is_some() {
        return Err(Nip98Error::BadHeader("trailing content".to_string()));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(payload))
        .map_err(|e| Nip98Error::BadHeader(e.to_string()))?;

    serde_json::from_slice(&decoded).map_err(|e| Nip98Error::BadHeader(e.to_string()))
}

/// What the server expects the auth event to bind.
#[derive(Debug, Clone)]
pub struct ValidationParams {
    pub url: String,
    pub method: HttpMethod,
    pub payload_hash: Option<String>,
    pub now: i64,
    pub timestamp_window: i64,
}

impl ValidationParams {
    pub fn new(url: impl Into<String>, method: HttpMethod, now: i64) -> Self {
        Self {
            url: url.into(),
            method,
            payload_hash: None,
            now,
            timestamp_window: DEFAULT_TIMESTAMP_WINDOW,
        }
    }

    pub fn with_payload_hash(mut self, hash: impl Into<String>) -> Self {
        self.payload_hash = Some(hash.into());
        self
    }

    pub fn with_timestamp_window(mut self, window: i64) -> Self {
        self.timestamp_window = window;
        self
    }
}

/// Full server-side validation: kind, signature, timestamp window, URL,
/// method and (when expected) payload hash. Returns the signer's pubkey.
pub fn validate_auth_event(
    event: &Event,
    params: &ValidationParams,
) -> Result<String, Nip98Error> {
    if event.kind != KIND_HTTP_AUTH {
        return Err(Nip98Error::WrongKind(event.kind));
    }

    // saturating: a hostile created_at near i64::MIN must not overflow
    if event.created_at.saturating_sub(params.now).saturating_abs() > params.timestamp_window {
        return Err(Nip98Error::TimestampOutOfWindow);
    }

    let auth = HttpAuth::from_event(event)?;

    if auth.url != params.url {
        return Err(Nip98Error::UrlMismatch {
            expected: params.url.clone(),
            actual: auth.url,
        });
    }

    if auth.method != params.method {
        return Err(Nip98Error::MethodMismatch {
            expected: params.method.as_str().to_string(),
            actual: auth.method.as_str().to_string(),
        });
    }

    if let Some(ref expected) = params.payload_hash {
        match auth.payload_hash {
            Some(ref actual) if actual == expected => {}
            Some(_) => return Err(Nip98Error::PayloadHashMismatch),
            None => return Err(Nip98Error::MissingTag("payload")),
        }
    }

    match event.verify() {
        Ok(true) => Ok(event.pubkey.clone()),
        _ => Err(Nip98Error::BadSignature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{generate_secret_key, get_public_key_hex};

    const URL: &str = "http://relay.example/";
    const NOW: i64 = 1700000000;

    fn signed_auth(auth: &HttpAuth, created_at: i64) -> (Event, String) {
        let sk = generate_secret_key();
        let event = build_auth_event(auth, &sk, created_at).unwrap();
        (event, get_public_key_hex(&sk).unwrap())
    }

    #[test]
    fn test_method_parse_and_format() {
        assert_eq!(HttpMethod::parse("get").unwrap(), HttpMethod::Get);
        assert_eq!(HttpMethod::parse("POST").unwrap(), HttpMethod::Post);
        assert_eq!(HttpMethod::Delete.as_str(), "DELETE");
        assert!(HttpMethod::parse("YEET").is_err());
    }

    #[test]
    fn test_tags_roundtrip() {
        let auth = HttpAuth::new(URL, HttpMethod::Post).with_payload_hash("abc123");
        let (event, _) = signed_auth(&auth, NOW);
        let parsed = HttpAuth::from_event(&event).unwrap();
        assert_eq!(parsed, auth);
    }

    #[test]
    fn test_header_roundtrip() {
        let auth = HttpAuth::new(URL, HttpMethod::Get);
        let (event, _) = signed_auth(&auth, NOW);

        let header = encode_authorization_header(&event).unwrap();
        assert!(header.starts_with("Nostr "));

        let decoded = decode_authorization_header(&header).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_header_wrong_scheme() {
        assert!(decode_authorization_header("Bearer abc").is_err());
        assert!(decode_authorization_header("Nostr").is_err());
    }

    #[test]
    fn test_validate_success_returns_pubkey() {
        let auth = HttpAuth::new(URL, HttpMethod::Get);
        let (event, pubkey) = signed_auth(&auth, NOW - 5);

        let params = ValidationParams::new(URL, HttpMethod::Get, NOW);
        assert_eq!(validate_auth_event(&event, &params).unwrap(), pubkey);
    }

    #[test]
    fn test_validate_wrong_kind() {
        let sk = generate_secret_key();
        let template = EventTemplate {
            kind: 1,
            created_at: NOW,
            tags: HttpAuth::new(URL, HttpMethod::Get).to_tags(),
            content: String::new(),
        };
        let event = finalize_event(&template, &sk).unwrap();

        let params = ValidationParams::new(URL, HttpMethod::Get, NOW);
        assert!(matches!(
            validate_auth_event(&event, &params),
            Err(Nip98Error::WrongKind(1))
        ));
    }

    #[test]
    fn test_validate_stale_and_future_timestamps() {
        let auth = HttpAuth::new(URL, HttpMethod::Get);
        let params = ValidationParams::new(URL, HttpMethod::Get, NOW);

        let (stale, _) = signed_auth(&auth, NOW - 120);
        assert!(matches!(
            validate_auth_event(&stale, &params),
            Err(Nip98Error::TimestampOutOfWindow)
        ));

        let (future, _) = signed_auth(&auth, NOW + 120);
        assert!(matches!(
            validate_auth_event(&future, &params),
            Err(Nip98Error::TimestampOutOfWindow)
        ));

        let (mut extreme, _) = signed_auth(&auth, NOW);
        extreme.created_at = i64::MIN;
        assert!(matches!(
            validate_auth_event(&extreme, &params),
            Err(Nip98Error::TimestampOutOfWindow)
        ));
    }

    #[test]
    fn test_validate_url_and_method_mismatch() {
        let auth = HttpAuth::new(URL, HttpMethod::Get);
        let (event, _) = signed_auth(&auth, NOW);

        let params = ValidationParams::new("http://other.example/", HttpMethod::Get, NOW);
        assert!(matches!(
            validate_auth_event(&event, &params),
            Err(Nip98Error::UrlMismatch { .. })
        ));

        let params = ValidationParams::new(URL, HttpMethod::Post, NOW);
        assert!(matches!(
            validate_auth_event(&event, &params),
            Err(Nip98Error::MethodMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_payload_hash() {
        let body = b"{\"method\":\"supportedmethods\",\"params\":[]}";
        let hash = hash_payload(body);

        let auth = HttpAuth::new(URL, HttpMethod::Post).with_payload_hash(hash.clone());
        let (event, _) = signed_auth(&auth, NOW);

        let ok = ValidationParams::new(URL, HttpMethod::Post, NOW).with_payload_hash(hash);
        assert!(validate_auth_event(&event, &ok).is_ok());

        let bad = ValidationParams::new(URL, HttpMethod::Post, NOW)
            .with_payload_hash(hash_payload(b"other body"));
        assert!(matches!(
            validate_auth_event(&event, &bad),
            Err(Nip98Error::PayloadHashMismatch)
        ));
    }

    #[test]
    fn test_validate_tampered_event() {
        let auth = HttpAuth::new(URL, HttpMethod::Get);
        let (mut event, _) = signed_auth(&auth, NOW);
        event.content = "tampered".to_string();

        let params = ValidationParams::new(URL, HttpMethod::Get, NOW);
        assert!(matches!(
            validate_auth_event(&event, &params),
            Err(Nip98Error::BadSignature)
        ));
    }
}
