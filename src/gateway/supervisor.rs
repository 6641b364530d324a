//! Broker connection supervisor with statum state machine
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──┐
//!      ▲               │                      │ connection lost
//!      │               ▼                      │
//!      │             Fatal (broadcast BROKER_FAIL, restart)
//!      └──────────────────────────────────────┘
//! ```
//!
//! Connecting makes a bounded number of attempts, each preceded by a fixed
//! delay and a BROKER_CHECK broadcast. Fatal is terminal: the restarter is called exactly once and the
//! supervisor never tries again.

use statum::{machine, state};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connectivity::{Connectivity, ConnectivityWriter};
use super::dispatcher::Dispatcher;
use super::Gateway;
use crate::channel::broadcast;
use crate::mqtt::{BrokerEvent, BrokerMessage};
use crate::protocol::{Notice, StatusCode};

/// Retry and timing parameters
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub wifi_settle: Duration,
    pub housekeeping: Duration,
    pub channel_poll: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 12,
            connect_delay: Duration::from_secs(5),
            wifi_settle: Duration::from_secs(1),
            housekeeping: Duration::from_secs(1),
            channel_poll: Duration::from_millis(20),
        }
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Disconnected, // No broker session
    Connecting,   // Bounded connect attempts in progress
    Connected,    // Session up, serving broker events
    Fatal,        // Attempts exhausted, restart pending
}

#[machine]
pub struct Supervisor<S: SupervisorState> {
    gateway: Gateway,
    settings: SupervisorSettings,
    connectivity: ConnectivityWriter,
    events: mpsc::Receiver<BrokerEvent>,
    dispatchers: Vec<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl<S: SupervisorState> Supervisor<S> {
    async fn announce(&self, code: StatusCode) {
        broadcast(&self.gateway.channels, &Notice::Status(code)).await;
    }
}

impl Supervisor<Disconnected> {
    pub fn create(
        gateway: Gateway,
        settings: SupervisorSettings,
        events: mpsc::Receiver<BrokerEvent>,
    ) -> Self {
        let (connectivity, _) = Connectivity::channel();
        Self::new(
            gateway,
            settings,
            connectivity,
            events,
            Vec::new(), // dispatchers
            Vec::new(), // watchers
        )
    }

    /// Read side of the connectivity state
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Starts channels and the Wi-Fi watcher, then supervises the broker
    /// session until attempts are exhausted and a restart was requested.
    pub async fn run(mut self) {
        for channel in &self.gateway.channels {
            if let Err(e) = channel.start().await {
                error!("Failed to start channel {}: {}", channel.name(), e);
            }
        }
        let watcher = spawn_wifi_watcher(
            self.gateway.clone(),
            self.connectivity.clone(),
            self.settings.wifi_settle,
        );
        self.watchers.push(watcher);

        let mut idle = self;
        loop {
            match idle.begin_connect().establish().await {
                Ok(connected) => idle = connected.announce_session().await.serve().await,
                Err(fatal) => {
                    fatal.escalate().await;
                    return;
                }
            }
        }
    }

    fn begin_connect(self) -> Supervisor<Connecting> {
        debug!("Starting broker connection attempts");
        self.transition()
    }
}

impl Supervisor<Connecting> {
    async fn establish(self) -> Result<Supervisor<Connected>, Supervisor<Fatal>> {
        let attempts = self.settings.connect_attempts;
        for attempt in 1..=attempts {
            // Give Wi-Fi time to settle before each attempt
            tokio::time::sleep(self.settings.connect_delay).await;
            self.announce(StatusCode::BrokerCheck).await;

            match self.gateway.broker.connect().await {
                Ok(()) => {
                    info!("Broker connected (attempt {}/{})", attempt, attempts);
                    self.connectivity.set_broker(true);
                    return Ok(self.transition());
                }
                Err(e) if !e.is_retryable() => {
                    error!("Broker connection cannot succeed: {}", e);
                    break;
                }
                Err(e) => warn!("Broker connect attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }
        error!("Giving up on broker after {} attempts", attempts);
        Err(self.transition())
    }
}

impl Supervisor<Connected> {
    /// Replays subscriptions, tells hosts and starts dispatchers once
    async fn announce_session(mut self) -> Self {
        let entries = self.gateway.registry.read().await.entries();
        for (topic, subscriber) in entries {
            if let Err(e) = self.gateway.broker.subscribe(&topic, subscriber.qos).await {
                warn!("Resubscribe to {} failed: {}", topic, e);
            }
        }

        self.announce(StatusCode::BrokerOk).await;
        self.announce(StatusCode::Running).await;

        if self.dispatchers.is_empty() {
            for channel in &self.gateway.channels {
                let dispatcher = Dispatcher::new(
                    channel.clone(),
                    &self.gateway,
                    self.connectivity.subscribe(),
                    self.settings.channel_poll,
                );
                self.dispatchers.push(dispatcher.spawn());
            }
            info!("Started {} dispatchers", self.dispatchers.len());
        }
        self
    }

    /// Serves broker events until the session is lost
    async fn serve(mut self) -> Supervisor<Disconnected> {
        let mut housekeeping = tokio::time::interval(self.settings.housekeeping);
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(BrokerEvent::Message(message)) => self.fan_out(&message).await,
                    Some(BrokerEvent::ConnectionLost(reason)) => {
                        warn!("Broker connection lost: {}", reason);
                        break;
                    }
                    None => {
                        warn!("Broker event stream closed");
                        break;
                    }
                },
                _ = housekeeping.tick() => self.housekeeping().await,
            }
        }

        self.connectivity.set_broker(false);
        self.transition()
    }

    async fn fan_out(&self, message: &BrokerMessage) {
        let subscribers = self.gateway.registry.read().await.subscribers_of(&message.topic);
        if subscribers.is_empty() {
            debug!("No subscribers for {}", message.topic);
            return;
        }
        let line = message.to_notice().encode();
        for subscriber in subscribers {
            if let Err(e) = subscriber.channel.send(&subscriber.host, &line).await {
                warn!(
                    "Forwarding {} to {} on {} failed: {}",
                    message.topic,
                    subscriber.host,
                    subscriber.channel.name(),
                    e
                );
            }
        }
    }

    async fn housekeeping(&self) {
        let mut registry = self.gateway.registry.write().await;
        registry.compact();
        debug!(
            "Housekeeping: {} subscriptions on {} topics",
            registry.len(),
            registry.topics().len()
        );
    }
}

impl Supervisor<Fatal> {
    async fn escalate(self) {
        self.announce(StatusCode::BrokerFail).await;
        self.gateway.restarter.restart();
        for watcher in &self.watchers {
            watcher.abort();
        }
    }
}

/// Broadcasts every Wi-Fi state, starting with the current one
fn spawn_wifi_watcher(
    gateway: Gateway,
    connectivity: ConnectivityWriter,
    settle: Duration,
) -> JoinHandle<()> {
    let mut wifi = gateway.network.subscribe();
    tokio::spawn(async move {
        loop {
            let up = *wifi.borrow_and_update();
            info!("Wi-Fi {}", if up { "up" } else { "down" });
            broadcast(&gateway.channels, &Notice::Status(StatusCode::wifi(up))).await;
            gateway.wifi_led.set(up);
            connectivity.set_wifi(up);
            tokio::time::sleep(settle).await;

            if wifi.changed().await.is_err() {
                debug!("Wi-Fi state source closed");
                break;
            }
        }
    })
}
