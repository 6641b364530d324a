//! # MQTT Integration Module
//!
//! Everything the gateway needs from the public broker lives here. Hosts never
//! see MQTT directly; the dispatcher and supervisor talk to the broker through
//! the [`BrokerClient`] trait and receive broker-originated traffic as
//! [`BrokerEvent`]s on an mpsc channel.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── acks.rs             - PUBACK/PUBCOMP/SUBACK matching
//! ├── config.rs           - Broker connection settings
//! ├── message_manager.rs  - Broker message representation
//! ├── mqtt_handler.rs     - rumqttc backed client and event pump
//! └── subscriptions.rs    - Topic -> (channel, host, qos) registry
//! ```
//!
//! ## Connection Ownership
//!
//! The client never reconnects on its own. `connect` performs exactly one
//! attempt; after a loss the event stream reports [`BrokerEvent::ConnectionLost`]
//! and the supervisor decides whether to try again or escalate.

mod acks;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod subscriptions;

pub use config::MqttConfig;
pub use message_manager::BrokerMessage;
pub use mqtt_handler::MqttHandler;
pub use subscriptions::{SharedRegistry, Subscriber, SubscriptionRegistry};

use async_trait::async_trait;
use rumqttc::QoS;

/// Events flowing from the broker towards the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// A publish arrived on a subscribed topic
    Message(BrokerMessage),
    /// The session dropped; no further events until the next `connect`
    ConnectionLost(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection to broker failed: {0}")]
    Connect(String),

    #[error("Broker refused connection: {0}")]
    Refused(String),

    #[error("Broker did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Broker request failed: {0}")]
    Request(String),

    #[error("Broker rejected subscription to {0}")]
    Rejected(String),

    #[error("Invalid broker configuration: {0}")]
    Config(String),
}

impl BrokerError {
    /// Errors worth another connection attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Config(_))
    }
}

/// Operations the gateway invokes on the broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// One connection attempt; resolves once the broker acknowledged it
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Resolves once the broker acknowledged the message; QoS 0 once it was
    /// written out
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
        qos: QoS,
    ) -> Result<(), BrokerError>;

    /// Resolves once the broker granted the subscription
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests;
