//! Subscription registry
//!
//! Remembers which host on which channel asked for which topic filter. Entries
//! are only added after the broker accepted the subscription and are never
//! removed, so the registry can be replayed verbatim after a reconnect.

use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channel::{Channel, HostId};

pub type SharedRegistry = Arc<RwLock<SubscriptionRegistry>>;

/// One host interested in a topic filter
#[derive(Clone)]
pub struct Subscriber {
    pub channel: Arc<dyn Channel>,
    pub host: HostId,
    pub qos: QoS,
}

impl Subscriber {
    pub fn new(channel: Arc<dyn Channel>, host: HostId, qos: QoS) -> Self {
        Self { channel, host, qos }
    }

    fn targets(&self, channel: &str, host: &HostId) -> bool {
        self.channel.name() == channel && &self.host == host
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("channel", &self.channel.name())
            .field("host", &self.host.to_string())
            .field("qos", &self.qos)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    filter: String,
    subscriber: Subscriber,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Records `subscriber` for `filter`. The first entry for a
    /// (filter, channel, host) triple wins; returns false for repeats.
    pub fn record(&mut self, filter: &str, subscriber: Subscriber) -> bool {
        let exists = self.entries.iter().any(|entry| {
            entry.filter == filter
                && entry
                    .subscriber
                    .targets(subscriber.channel.name(), &subscriber.host)
        });
        if exists {
            return false;
        }
        self.entries.push(Entry {
            filter: filter.to_string(),
            subscriber,
        });
        true
    }

    /// Subscribers whose filter matches `topic`, at most once per
    /// (channel, host), in registration order
    pub fn subscribers_of(&self, topic: &str) -> Vec<Subscriber> {
        let mut matched: Vec<Subscriber> = Vec::new();
        for entry in &self.entries {
            if !filter_matches(&entry.filter, topic) {
                continue;
            }
            let seen = matched
                .iter()
                .any(|s| s.targets(entry.subscriber.channel.name(), &entry.subscriber.host));
            if !seen {
                matched.push(entry.subscriber.clone());
            }
        }
        matched
    }

    /// Every (filter, subscriber) pair in registration order
    pub fn entries(&self) -> Vec<(String, Subscriber)> {
        self.entries
            .iter()
            .map(|entry| (entry.filter.clone(), entry.subscriber.clone()))
            .collect()
    }

    /// Distinct filters in order of first registration
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !topics.contains(&entry.filter) {
                topics.push(entry.filter.clone());
            }
        }
        topics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases spare capacity
    pub fn compact(&mut self) {
        self.entries.shrink_to_fit();
    }
}

fn filter_matches(filter: &str, topic: &str) -> bool {
    filter == topic || (rumqttc::valid_filter(filter) && rumqttc::matches(topic, filter))
}
