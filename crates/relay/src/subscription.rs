//! Per-connection subscription state

use nostr_core::{Event, Filter, matches_any};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: String, filters: Vec<Filter>) -> Self {
        Self { id, filters }
    }

    pub fn matches(&self, event: &Event) -> bool {
        matches_any(&self.filters, event)
    }
}

/// Subscriptions held by a single connection, capped at `max_subs`.
pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
    max_subs: usize,
}

impl SubscriptionManager {
    pub fn new(max_subs: usize) -> Self {
        Self {
            subscriptions: HashMap::new(),
            max_subs,
        }
    }

    /// Install a subscription. Re-using an id replaces the previous
    /// filters. Returns false when the cap would be exceeded.
    pub fn subscribe(&mut self, id: String, filters: Vec<Filter>) -> bool {
        if !self.subscriptions.contains_key(&id) && self.subscriptions.len() >= self.max_subs {
            return false;
        }
        self.subscriptions
            .insert(id.clone(), Subscription::new(id, filters));
        true
    }

    /// Returns true when the id was present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Subscription ids whose filters match `event`.
    pub fn matching_ids(&self, event: &Event) -> Vec<&str> {
        self.subscriptions
            .values()
            .filter(|sub| sub.matches(event))
            .map(|sub| sub.id.as_str())
            .collect()
    }
}
