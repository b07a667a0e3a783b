//! Relay configuration
//!
//! Configuration comes from a flat `key = value` file, overridden by
//! `NOSTR_RELAY_*` environment variables (key uppercased). Unknown keys in
//! the file are rejected so typos fail loudly at startup.

use crate::error::{RelayError, Result};
use std::net::SocketAddr;
use std::path::Path;

/// NIP-42 authentication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Off,
    Optional,
    Required,
}

impl AuthMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(AuthMode::Off),
            "optional" => Ok(AuthMode::Optional),
            "required" => Ok(AuthMode::Required),
            other => Err(RelayError::Config(format!(
                "auth must be off|optional|required, got '{}'",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Off => "off",
            AuthMode::Optional => "optional",
            AuthMode::Required => "required",
        }
    }

    /// Whether an AUTH challenge is issued on connect.
    pub fn challenges(self) -> bool {
        self != AuthMode::Off
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub http_listen: SocketAddr,
    pub storage_driver: String,
    pub storage_uri: String,
    pub supported_nips: Vec<u16>,
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subs: usize,
    pub max_message_size: usize,
    pub rate_ops_per_sec: u64,
    pub rate_burst: u64,
    pub auth: AuthMode,
    pub relay_url: String,
    pub name: String,
    pub software: String,
    pub version: String,
    pub description: String,
    pub contact: String,
    pub icon: Option<String>,
    pub negentropy_enabled: bool,
    pub replay_ttl_seconds: u64,
    pub skew_future_seconds: u64,
    pub skew_past_seconds: u64,
    pub backpressure_max_ticks: u32,
    pub policy_file: String,
    pub admin_pubkey: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7000".parse().unwrap_or_else(|_| unreachable!()),
            http_listen: "127.0.0.1:7001".parse().unwrap_or_else(|_| unreachable!()),
            storage_driver: "sqlite".to_string(),
            storage_uri: "relay.db".to_string(),
            supported_nips: vec![1, 11, 42, 45, 50, 77, 86, 98],
            max_filters: 10,
            max_limit: 500,
            max_subs: 20,
            max_message_size: 512 * 1024,
            rate_ops_per_sec: 10,
            rate_burst: 20,
            auth: AuthMode::Off,
            relay_url: "ws://127.0.0.1:7000".to_string(),
            name: "nostr-relay".to_string(),
            software: "https://github.com/nostr-relay/nostr-relay".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            contact: String::new(),
            icon: None,
            negentropy_enabled: true,
            replay_ttl_seconds: 900,
            skew_future_seconds: 600,
            skew_past_seconds: 86400,
            backpressure_max_ticks: 16,
            policy_file: "relay_policy.json".to_string(),
            admin_pubkey: None,
        }
    }
}

impl Config {
    /// Load from a config file (missing file means defaults), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = path {
            let body = std::fs::read_to_string(path).map_err(|e| {
                RelayError::Config(format!("cannot read {}: {}", path.display(), e))
            })?;
            config.apply_file(&body)?;
        }
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, body: &str) -> Result<()> {
        for (lineno, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                RelayError::Config(format!("line {}: expected key = value", lineno + 1))
            })?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        for key in KEYS {
            let env_name = format!("NOSTR_RELAY_{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&env_name) {
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "listen" => self.listen = parse_addr(key, value)?,
            "http_listen" => self.http_listen = parse_addr(key, value)?,
            "storage_driver" => self.storage_driver = value.to_string(),
            "storage_uri" => self.storage_uri = value.to_string(),
            "supported_nips" => {
                self.supported_nips = value
                    .split(',')
                    .map(|s| parse_num(key, s.trim()))
                    .collect::<Result<_>>()?;
            }
            "max_filters" => self.max_filters = parse_num(key, value)?,
            "max_limit" => self.max_limit = parse_num(key, value)?,
            "max_subs" => self.max_subs = parse_num(key, value)?,
            "max_message_size" => self.max_message_size = parse_num(key, value)?,
            "rate_ops_per_sec" => self.rate_ops_per_sec = parse_num(key, value)?,
            "rate_burst" => self.rate_burst = parse_num(key, value)?,
            "auth" => self.auth = AuthMode::parse(value)?,
            "relay_url" => self.relay_url = value.to_string(),
            "name" => self.name = value.to_string(),
            "software" => self.software = value.to_string(),
            "version" => self.version = value.to_string(),
            "description" => self.description = value.to_string(),
            "contact" => self.contact = value.to_string(),
            "icon" => self.icon = Some(value.to_string()),
            "negentropy_enabled" => self.negentropy_enabled = parse_bool(key, value)?,
            "replay_ttl_seconds" => self.replay_ttl_seconds = parse_num(key, value)?,
            "skew_future_seconds" => self.skew_future_seconds = parse_num(key, value)?,
            "skew_past_seconds" => self.skew_past_seconds = parse_num(key, value)?,
            "backpressure_max_ticks" => self.backpressure_max_ticks = parse_num(key, value)?,
            "policy_file" => self.policy_file = value.to_string(),
            "admin_pubkey" => self.admin_pubkey = Some(value.to_string()),
            other => {
                return Err(RelayError::Config(format!("unknown key '{}'", other)));
            }
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "listen",
    "http_listen",
    "storage_driver",
    "storage_uri",
    "supported_nips",
    "max_filters",
    "max_limit",
    "max_subs",
    "max_message_size",
    "rate_ops_per_sec",
    "rate_burst",
    "auth",
    "relay_url",
    "name",
    "software",
    "version",
    "description",
    "contact",
    "icon",
    "negentropy_enabled",
    "replay_ttl_seconds",
    "skew_future_seconds",
    "skew_past_seconds",
    "backpressure_max_ticks",
    "policy_file",
    "admin_pubkey",
];

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|_| RelayError::Config(format!("{}: '{}' is not host:port", key, value)))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| RelayError::Config(format!("{}: '{}' is not a number", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(RelayError::Config(format!(
            "{}: '{}' is not a boolean",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage_driver, "sqlite");
        assert_eq!(config.auth, AuthMode::Off);
        assert_eq!(config.max_subs, 20);
        assert_eq!(config.replay_ttl_seconds, 900);
    }

    #[test]
    fn test_file_parse() {
        let mut config = Config::default();
        config
            .apply_file(
                "# comment\n\
                 listen = 0.0.0.0:8080\n\
                 max_limit = 1000\n\
                 auth = required\n\
                 supported_nips = 1, 11, 42\n\
                 negentropy_enabled = false\n",
            )
            .unwrap();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.max_limit, 1000);
        assert_eq!(config.auth, AuthMode::Required);
        assert_eq!(config.supported_nips, vec![1, 11, 42]);
        assert!(!config.negentropy_enabled);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.apply_file("max_limits = 10\n"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_malformed_line_rejected() {
        let mut config = Config::default();
        assert!(config.apply_file("just a line\n").is_err());
        assert!(config.apply_file("auth = sometimes\n").is_err());
        assert!(config.apply_file("max_subs = many\n").is_err());
    }

    #[test]
    fn test_auth_mode_challenges() {
        assert!(!AuthMode::Off.challenges());
        assert!(AuthMode::Optional.challenges());
        assert!(AuthMode::Required.challenges());
    }
}
