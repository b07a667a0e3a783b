//! NIP-11 relay information document
//!
//! Served as JSON on every plain GET to the HTTP listener root.
//! Admin overrides for name, description and icon take precedence over
//! the static config.

use crate::config::Config;
use crate::policy::AdminPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLimitation {
    pub max_filters: usize,
    pub max_limit: usize,
    pub max_subscriptions: usize,
    pub rate_ops_per_sec: u64,
    pub rate_burst: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayInfo {
    pub name: String,
    pub software: String,
    pub version: String,
    pub description: String,
    pub contact: String,
    pub supported_nips: Vec<u16>,
    pub limitation: RelayLimitation,
    /// One of "off", "optional", "required".
    pub auth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl RelayInfo {
    pub fn build(config: &Config, admin: &AdminPolicy) -> Self {
        Self {
            name: admin
                .relay_name
                .clone()
                .unwrap_or_else(|| config.name.clone()),
            software: config.software.clone(),
            version: config.version.clone(),
            description: admin
                .relay_description
                .clone()
                .unwrap_or_else(|| config.description.clone()),
            contact: config.contact.clone(),
            supported_nips: config.supported_nips.clone(),
            limitation: RelayLimitation {
                max_filters: config.max_filters,
                max_limit: config.max_limit,
                max_subscriptions: config.max_subs,
                rate_ops_per_sec: config.rate_ops_per_sec,
                rate_burst: config.rate_burst,
            },
            auth: config.auth.as_str().to_string(),
            icon: admin.relay_icon.clone().or_else(|| config.icon.clone()),
        }
    }
}
