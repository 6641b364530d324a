use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::NetworkMonitor;

/// Reads the link state from `/sys/class/net/<interface>/operstate`
pub struct SysfsNetworkMonitor {
    reach_host: String,
    reach_timeout: Duration,
    state: watch::Receiver<bool>,
}

impl SysfsNetworkMonitor {
    /// Starts polling `interface` every `poll`; stops when `token` is cancelled
    pub fn start(
        interface: &str,
        reach_host: impl Into<String>,
        poll: Duration,
        token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(false);
        let path = operstate_path(interface);
        let interface = interface.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let up = read_link_state(&path).await;
                let changed = tx.send_if_modified(|current| {
                    if *current != up {
                        *current = up;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    info!("Interface {} is {}", interface, if up { "up" } else { "down" });
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            debug!("Network monitor for {} stopped", interface);
        });

        let monitor = Self {
            reach_host: reach_host.into(),
            reach_timeout: Duration::from_secs(2),
            state: rx,
        };
        (monitor, handle)
    }
}

#[async_trait]
impl NetworkMonitor for SysfsNetworkMonitor {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    async fn is_reachable(&self) -> bool {
        if !*self.state.borrow() {
            return false;
        }
        let lookup = tokio::net::lookup_host((self.reach_host.as_str(), 53));
        match tokio::time::timeout(self.reach_timeout, lookup).await {
            Ok(Ok(mut addrs)) => addrs.next().is_some(),
            Ok(Err(e)) => {
                debug!("Lookup of {} failed: {}", self.reach_host, e);
                false
            }
            Err(_) => {
                debug!("Lookup of {} timed out", self.reach_host);
                false
            }
        }
    }
}

fn operstate_path(interface: &str) -> PathBuf {
    PathBuf::from("/sys/class/net").join(interface).join("operstate")
}

async fn read_link_state(path: &Path) -> bool {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_operstate(&content),
        Err(_) => false,
    }
}

/// Interprets the content of an `operstate` file. Some wireless drivers
/// never leave "unknown" while carrying traffic, so that counts as up.
pub fn parse_operstate(content: &str) -> bool {
    matches!(content.trim(), "up" | "unknown")
}
