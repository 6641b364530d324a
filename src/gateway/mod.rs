//! # Gateway Core
//!
//! Ties channels, broker and system collaborators together.
//!
//! ## Task Layout
//!
//! ```text
//!                 ┌──────────────┐   BrokerEvent    ┌─────────────┐
//!                 │  MqttHandler │ ───────────────► │ Supervisor  │──► fan-out
//!                 └──────────────┘                  └─────────────┘
//!                        ▲                             │ spawns once
//!   host ◄──► Channel ──► Dispatcher (one per channel) ◄┘
//!                                   │
//!                        SubscriptionRegistry
//! ```
//!
//! The supervisor is the only task that writes [`Connectivity`]; the Wi-Fi
//! watcher it spawns shares that role. Dispatchers only read it.
//!
//! ## Startup Ordering
//!
//! connect → replay registry → BROKER_OK → RUNNING → dispatchers. Dispatchers
//! are started after the first successful connect and never restarted; a
//! dispatcher ends only when its channel is stopped.

pub mod connectivity;
pub mod dispatcher;
pub mod supervisor;

pub use connectivity::Connectivity;
pub use dispatcher::Dispatcher;
pub use supervisor::{Supervisor, SupervisorSettings};

use std::sync::Arc;

use crate::channel::Channel;
use crate::mqtt::{BrokerClient, SharedRegistry};
use crate::system::{Indicator, MemoryProbe, NetworkMonitor, Restarter, TimeSource};

/// Handles shared by every gateway task
#[derive(Clone)]
pub struct Gateway {
    pub channels: Vec<Arc<dyn Channel>>,
    pub broker: Arc<dyn BrokerClient>,
    pub registry: SharedRegistry,
    pub network: Arc<dyn NetworkMonitor>,
    pub clock: Arc<dyn TimeSource>,
    pub memory: Arc<dyn MemoryProbe>,
    pub wifi_led: Arc<dyn Indicator>,
    pub restarter: Arc<dyn Restarter>,
}
