//! # Host Channels
//!
//! A channel is a duplex text link between the gateway and one or more hosts.
//! Hosts cannot speak MQTT or IP themselves, so every host-facing transport is
//! hidden behind the [`Channel`] trait and the rest of the gateway only sees
//! `(host, line)` pairs.
//!
//! ## Transports
//!
//! ```text
//! channel/
//! ├── serial.rs    - wired point-to-point link, one implicit host
//! └── datagram.rs  - wireless datagram link, one host per peer address
//! ```
//!
//! ## Host Discovery
//!
//! Each channel keeps a [`HostSet`]. A host enters the set the first time it
//! is seen as a sender or addressed by `send`, and never leaves it. Routing
//! keys elsewhere in the gateway are always the pair (channel, host) because
//! host identities are only unique within one channel.
//!
//! ## Error Classification
//!
//! Interface faults (device gone, network down) are absorbed inside the
//! transport: it reinitialises itself and `send` still returns `Ok`. The
//! errors that do reach the caller are described by [`ChannelError`].

pub mod datagram;
pub mod serial;

pub use datagram::DatagramChannel;
pub use serial::{LinkPort, SerialChannel};

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::protocol::Notice;

/// Opaque transport-assigned host address
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HostId(Vec<u8>);

impl HostId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string().into_bytes())
    }

    /// Interprets the identity as a socket address, if it is one
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        std::str::from_utf8(&self.0).ok()?.parse().ok()
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| !c.is_control()) => f.write_str(text),
            _ => {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HostId({})", self)
    }
}

/// Insertion-ordered set of hosts a channel has seen
#[derive(Debug, Default)]
pub struct HostSet {
    hosts: RwLock<Vec<HostId>>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `host`; returns true if it was not known before
    pub fn observe(&self, host: &HostId) -> bool {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        if hosts.contains(host) {
            return false;
        }
        hosts.push(host.clone());
        true
    }

    pub fn contains(&self, host: &HostId) -> bool {
        self.hosts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(host)
    }

    pub fn snapshot(&self) -> Vec<HostId> {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} is not running")]
    NotRunning(String),

    #[error("Channel {channel} cannot address host {host}")]
    InvalidHost { channel: String, host: HostId },

    #[error("Failed to open transport: {0}")]
    Open(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Transient faults may succeed on the next call without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::NotRunning(_))
    }
}

/// Transport-agnostic duplex endpoint towards hosts
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel name from the configuration
    fn name(&self) -> &str;

    /// Transport bring-up, called once before any send or receive
    async fn start(&self) -> Result<(), ChannelError>;

    /// Sends one line to `host`, registering the host if it is new
    async fn send(&self, host: &HostId, payload: &str) -> Result<(), ChannelError>;

    /// Waits for the next inbound line.
    ///
    /// Polls the transport and sleeps `poll_interval` between empty polls.
    /// Returns `None` only once the channel has been stopped.
    async fn await_message(&self, poll_interval: Duration) -> Option<(HostId, String)>;

    /// Tears the transport down; pending and future `await_message` calls
    /// return `None`
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Hosts seen so far, in discovery order
    fn hosts(&self) -> Vec<HostId>;
}

/// Sends `notice` to every known host on every channel.
///
/// Failures are logged per host and never abort the fan-out.
pub async fn broadcast(channels: &[Arc<dyn Channel>], notice: &Notice) {
    let line = notice.encode();
    for channel in channels {
        for host in channel.hosts() {
            match channel.send(&host, &line).await {
                Ok(_) => debug!("Broadcast {} to {}@{}", line, host, channel.name()),
                Err(e) if e.is_transient() => warn!(
                    "Failed to broadcast to {}@{}: {}",
                    host,
                    channel.name(),
                    e
                ),
                Err(e) => error!("Cannot reach {}@{}: {}", host, channel.name(), e),
            }
        }
    }
}
