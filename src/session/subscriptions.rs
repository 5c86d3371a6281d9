//! Subscription table
//!
//! Holds the topic filters the broker has granted, with the QoS it granted
//! for each. Entries are added on SUBACK and removed on UNSUBACK, so the
//! table only ever reflects acknowledged state. Re-subscribing to a filter
//! replaces its granted QoS.

use std::collections::BTreeMap;

use crate::codec::{QoS, SubscribeFilter, topic};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionTable {
    filters: BTreeMap<String, QoS>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a granted subscription, returning the previously granted QoS.
    pub fn insert(&mut self, filter: impl Into<String>, granted: QoS) -> Option<QoS> {
        self.filters.insert(filter.into(), granted)
    }

    pub fn remove(&mut self, filter: &str) -> Option<QoS> {
        self.filters.remove(filter)
    }

    pub fn granted(&self, filter: &str) -> Option<QoS> {
        self.filters.get(filter).copied()
    }

    /// Filters matching `topic`, with their granted QoS.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = (&'a str, QoS)> + 'a {
        self.filters
            .iter()
            .filter(move |(filter, _)| topic::matches(filter, topic))
            .map(|(filter, qos)| (filter.as_str(), *qos))
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.matching(topic).next().is_some()
    }

    /// All entries as SUBSCRIBE filters, for re-subscribing after a session loss.
    pub fn to_filters(&self) -> Vec<SubscribeFilter> {
        self.filters
            .iter()
            .map(|(filter, qos)| SubscribeFilter::new(filter.clone(), *qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }
}
