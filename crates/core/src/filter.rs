//! Subscription filters
//!
//! A filter matches events by id/author prefixes, kinds, tag values,
//! a `since`/`until` time window (inclusive) and an optional free-text
//! `search` query. Fields combine by AND within a filter; arrays of
//! filters combine by OR.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter: {0}")]
    Invalid(String),
}

/// Nostr subscription filter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Filter {
    /// Event id prefixes (lowercase hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey prefixes (lowercase hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    /// Events must be at or after this Unix timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Events must be at or before this Unix timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    /// Maximum number of events to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Free-text query; matching is backend-dependent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag filters, e.g. "#e": [event ids], "#p": [pubkeys]
    #[serde(flatten)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, Vec<String>>>,
}

impl Filter {
    /// Create a new empty filter (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors
                .iter()
                .any(|author| event.pubkey.starts_with(author.as_str()))
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        if let Some(ref tag_filters) = self.tags {
            for (tag_name, tag_values) in tag_filters {
                let tag_key = tag_name.trim_start_matches('#');

                let has_matching_tag = event.tags.iter().any(|event_tag| {
                    event_tag.len() >= 2
                        && event_tag[0] == tag_key
                        && tag_values.iter().any(|v| &event_tag[1] == v)
                });

                if !has_matching_tag {
                    return false;
                }
            }
        }

        true
    }

    /// True if the filter carries a non-empty search query
    pub fn has_search(&self) -> bool {
        self.search.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Check structural validity: hex prefixes, tag keys of the form
    /// `#<single lowercase letter>`, a sane time window.
    pub fn validate(&self) -> Result<(), FilterError> {
        if let Some(ref ids) = self.ids {
            for id in ids {
                if id.len() > 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(FilterError::Invalid(format!("bad id prefix: {}", id)));
                }
            }
        }

        if let Some(ref authors) = self.authors {
            for author in authors {
                if author.len() > 64 || !author.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(FilterError::Invalid(format!(
                        "bad author prefix: {}",
                        author
                    )));
                }
            }
        }

        if let Some(ref tags) = self.tags {
            for key in tags.keys() {
                let mut chars = key.chars();
                let valid = chars.next() == Some('#')
                    && matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
                    && chars.next().is_none();
                if !valid {
                    return Err(FilterError::Invalid(format!("bad tag key: {}", key)));
                }
            }
        }

        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(FilterError::Invalid("since after until".to_string()));
        }

        Ok(())
    }
}

/// Check if an event matches any filter in a set (OR semantics).
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}
