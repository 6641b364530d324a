//! Wireless datagram channel
//!
//! Every datagram carries one protocol line. Hosts are identified by their
//! peer address, and a peer must be present in the peer table before the
//! first datagram is sent to it. Unknown senders are registered on receipt.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use super::{Channel, ChannelError, HostId, HostSet};

const MAX_DATAGRAM: usize = 2048;

pub struct DatagramChannel {
    name: String,
    bind: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peers: Mutex<HashSet<SocketAddr>>,
    running: AtomicBool,
    hosts: HostSet,
}

impl DatagramChannel {
    /// `peers` pre-seeds the peer table; they are not hosts until observed
    pub fn new(name: impl Into<String>, bind: SocketAddr, peers: Vec<SocketAddr>) -> Self {
        Self {
            name: name.into(),
            bind,
            socket: RwLock::new(None),
            peers: Mutex::new(peers.into_iter().collect()),
            running: AtomicBool::new(false),
            hosts: HostSet::new(),
        }
    }

    /// Address the socket is actually bound to (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_socket()?.local_addr().ok()
    }

    /// Adds `addr` to the peer table; returns true if it was missing
    pub fn add_peer(&self, addr: SocketAddr) -> bool {
        let added = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr);
        if added {
            debug!("Registered peer {} on {}", addr, self.name);
        }
        added
    }

    pub fn is_peer(&self, addr: &SocketAddr) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(addr)
    }

    fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn observe(&self, host: &HostId, addr: SocketAddr) {
        if self.hosts.observe(host) {
            info!("New host {} on {}", host, self.name);
        }
        self.add_peer(addr);
    }

    /// Drops the current socket and binds a fresh one
    async fn reinitialise(&self) -> Result<(), ChannelError> {
        self.socket
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let socket = UdpSocket::bind(self.bind).await?;
        *self.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(socket));
        info!("Rebound datagram socket for {} on {}", self.name, self.bind);
        Ok(())
    }
}

#[async_trait]
impl Channel for DatagramChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        // An address that is not up yet is bound again by later sends and polls
        match UdpSocket::bind(self.bind).await {
            Ok(socket) => {
                info!(
                    "Datagram channel {} listening on {}",
                    self.name,
                    socket.local_addr()?
                );
                *self.socket.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(socket));
            }
            Err(e) => warn!(
                "Datagram channel {} cannot bind {} yet: {}",
                self.name, self.bind, e
            ),
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, host: &HostId, payload: &str) -> Result<(), ChannelError> {
        if !self.is_running() {
            return Err(ChannelError::NotRunning(self.name.clone()));
        }
        let addr = host
            .to_socket_addr()
            .ok_or_else(|| ChannelError::InvalidHost {
                channel: self.name.clone(),
                host: host.clone(),
            })?;
        self.observe(host, addr);

        let socket = match self.current_socket() {
            Some(socket) => socket,
            None => {
                if let Err(e) = self.reinitialise().await {
                    warn!("Dropped line for {} on {}: {}", host, self.name, e);
                    return Ok(());
                }
                match self.current_socket() {
                    Some(socket) => socket,
                    None => return Ok(()),
                }
            }
        };

        if let Err(e) = socket.send_to(payload.as_bytes(), addr).await {
            warn!("Send to {} on {} failed: {}", host, self.name, e);
            drop(socket);
            if let Err(e) = self.reinitialise().await {
                error!("Failed to reinitialise {}: {}", self.name, e);
            }
        }
        Ok(())
    }

    async fn await_message(&self, poll_interval: Duration) -> Option<(HostId, String)> {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        while self.is_running() {
            let socket = match self.current_socket() {
                Some(socket) => Some(socket),
                None => match self.reinitialise().await {
                    Ok(()) => self.current_socket(),
                    Err(e) => {
                        debug!("Datagram socket for {} still unavailable: {}", self.name, e);
                        None
                    }
                },
            };
            if let Some(socket) = socket {
                match socket.try_recv_from(&mut buffer) {
                    Ok((n, addr)) => {
                        let host = HostId::from_socket_addr(addr);
                        self.observe(&host, addr);
                        let line = String::from_utf8_lossy(&buffer[..n]);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if !line.is_empty() {
                            return Some((host, line.to_string()));
                        }
                        continue;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => warn!("Receive on {} failed: {}", self.name, e),
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
        None
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.socket
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!("Datagram channel {} stopped", self.name);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hosts(&self) -> Vec<HostId> {
        self.hosts.snapshot()
    }
}
