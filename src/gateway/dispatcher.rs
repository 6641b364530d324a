//! Per-channel command loop
//!
//! Reads one line at a time from a channel, executes it and answers the
//! sending host on the same channel. Nothing that goes wrong while handling a
//! line ends the loop; the only exit is the channel being stopped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connectivity, Gateway};
use crate::channel::{Channel, HostId};
use crate::mqtt::{BrokerClient, SharedRegistry, Subscriber};
use crate::protocol::{Command, Notice, StatusCode};
use crate::system::{MemoryProbe, MemoryUsage, NetworkMonitor, TimeSource};

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    broker: Arc<dyn BrokerClient>,
    registry: SharedRegistry,
    network: Arc<dyn NetworkMonitor>,
    clock: Arc<dyn TimeSource>,
    memory: Arc<dyn MemoryProbe>,
    connectivity: watch::Receiver<Connectivity>,
    poll: Duration,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn Channel>,
        gateway: &Gateway,
        connectivity: watch::Receiver<Connectivity>,
        poll: Duration,
    ) -> Self {
        Self {
            channel,
            broker: gateway.broker.clone(),
            registry: gateway.registry.clone(),
            network: gateway.network.clone(),
            clock: gateway.clock.clone(),
            memory: gateway.memory.clone(),
            connectivity,
            poll,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        info!("Dispatcher for {} started", self.channel.name());
        while let Some((host, line)) = self.channel.await_message(self.poll).await {
            self.handle(&host, &line).await;
        }
        info!("Dispatcher for {} stopped", self.channel.name());
    }

    /// Executes one line from `host` and sends the replies back
    pub async fn handle(&self, host: &HostId, line: &str) {
        debug!("{}:{} -> {}", self.channel.name(), host, line);
        for reply in self.execute(host, line).await {
            if let Err(e) = self.channel.send(host, &reply.encode()).await {
                warn!(
                    "Reply to {} on {} failed: {}",
                    host,
                    self.channel.name(),
                    e
                );
            }
        }
    }

    async fn execute(&self, host: &HostId, line: &str) -> Vec<Notice> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!("Rejected {:?} from {}: {}", line, host, e);
                return vec![Notice::Unknown(line.to_string())];
            }
        };

        debug!("Executing {} for {}", command.verb(), host);
        match command {
            Command::Publish {
                topic,
                payload,
                retain,
                qos,
            } => match self.broker.publish(&topic, &payload, retain, qos).await {
                Ok(()) => vec![Notice::Status(StatusCode::PubOk)],
                Err(e) => {
                    warn!("Publish to {} for {} failed: {}", topic, host, e);
                    vec![Notice::Status(StatusCode::PubFail)]
                }
            },
            Command::Subscribe { topic, qos } => match self.broker.subscribe(&topic, qos).await {
                Ok(()) => {
                    let subscriber = Subscriber::new(self.channel.clone(), host.clone(), qos);
                    if self.registry.write().await.record(&topic, subscriber) {
                        info!("{} on {} subscribed to {}", host, self.channel.name(), topic);
                    }
                    Vec::new()
                }
                Err(e) => {
                    warn!("Subscribe to {} for {} failed: {}", topic, host, e);
                    vec![Notice::Status(StatusCode::SubFail)]
                }
            },
            Command::Mem => {
                self.registry.write().await.compact();
                let usage = self.memory.usage().await.unwrap_or_else(|e| {
                    warn!("Memory figures unavailable: {}", e);
                    MemoryUsage::default()
                });
                vec![Notice::Mem {
                    free: usage.free,
                    used: usage.used,
                }]
            }
            Command::Time => vec![Notice::Time(self.fetch_time().await)],
            Command::Status => {
                let state = *self.connectivity.borrow();
                let mut replies = vec![Notice::Status(StatusCode::wifi(state.wifi_up))];
                if state.broker_connected {
                    replies.push(Notice::Status(StatusCode::BrokerOk));
                }
                replies
            }
        }
    }

    /// Unix seconds, or 0 when no trustworthy time can be had
    async fn fetch_time(&self) -> u64 {
        let connected = self.connectivity.borrow().broker_connected;
        if !connected {
            debug!("Time requested while broker is down");
            return 0;
        }
        if !self.network.is_reachable().await {
            debug!("Time requested while network is unreachable");
            return 0;
        }
        match self.clock.now().await {
            Ok(now) => now,
            Err(e) => {
                warn!("Time query failed: {}", e);
                0
            }
        }
    }
}
