use chrono::{DateTime, Local};
use std::fmt;

use crate::protocol::Notice;

const PREVIEW_LEN: usize = 32;

/// A publish received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub received_at: DateTime<Local>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, retain: bool) -> Self {
        BrokerMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain,
            received_at: Local::now(),
        }
    }

    /// The line forwarded to subscribed hosts
    pub fn to_notice(&self) -> Notice {
        Notice::Subscription {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            retain: self.retain,
        }
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(PREVIEW_LEN).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}
