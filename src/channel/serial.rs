//! Wired point-to-point channel
//!
//! The wired link has exactly one peer on the other end of the cable, so the
//! channel exposes a single implicit host and ignores the host argument when
//! sending. Frames are newline terminated lines.
//!
//! Port reads and writes block, so they run on tokio's blocking pool. A port
//! that cannot be opened, at start or later, is retried on every poll.

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{Channel, ChannelError, HostId, HostSet};

const READ_CHUNK: usize = 256;
const MAX_READS_PER_POLL: usize = 16;

/// Identity of the peer at the other end of the wire
pub const LINK_PEER: &str = "link";

/// Byte-level access to the wired link
pub trait LinkPort: Send {
    /// Reads whatever is available; `Ok(0)` when nothing arrived
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

type PortOpener = Box<dyn Fn() -> Result<Box<dyn LinkPort>, ChannelError> + Send + Sync>;

/// Serial device backed link port
struct SerialDevice {
    port: Box<dyn SerialPort>,
}

impl LinkPort for SerialDevice {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}

/// Port, opener and receive buffer; shared with the blocking I/O pool
struct Link {
    name: String,
    opener: PortOpener,
    port: Mutex<Option<Box<dyn LinkPort>>>,
    inbound: Mutex<Vec<u8>>,
    unavailable: AtomicBool,
}

impl Link {
    fn reopen(&self, port: &mut Option<Box<dyn LinkPort>>) {
        match (self.opener)() {
            Ok(fresh) => {
                info!("Link port for {} ready", self.name);
                self.unavailable.store(false, Ordering::SeqCst);
                *port = Some(fresh);
            }
            Err(e) => {
                if self.unavailable.swap(true, Ordering::SeqCst) {
                    debug!("Link port for {} still unavailable: {}", self.name, e);
                } else {
                    error!("Failed to reinitialise link port for {}: {}", self.name, e);
                }
                *port = None;
            }
        }
    }

    /// Drains the port into the inbound buffer and pops one complete line
    fn poll_line(&self) -> Option<String> {
        {
            let mut port = self.port.lock().unwrap_or_else(|e| e.into_inner());
            if port.is_none() {
                self.reopen(&mut port);
            }

            if let Some(link) = port.as_mut() {
                let mut chunk = [0u8; READ_CHUNK];
                let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
                // Bounded so a chatty peer cannot hold the port forever
                for _ in 0..MAX_READS_PER_POLL {
                    match link.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => inbound.extend_from_slice(&chunk[..n]),
                        Err(e) => {
                            warn!("Read from {} failed: {}", self.name, e);
                            *port = None;
                            break;
                        }
                    }
                }
            }
        }

        let mut inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(end) = inbound.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = inbound.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }

    /// Writes one frame; faults reopen the port and are absorbed
    fn write_frame(&self, frame: &[u8]) {
        let mut port = self.port.lock().unwrap_or_else(|e| e.into_inner());
        if port.is_none() {
            self.reopen(&mut port);
        }
        match port.as_mut() {
            Some(link) => {
                if let Err(e) = link.write_all(frame) {
                    warn!("Write to {} failed, reinitialising: {}", self.name, e);
                    self.reopen(&mut port);
                }
            }
            None => warn!("Dropped line for {}: link port unavailable", self.name),
        }
    }

    fn close(&self) {
        *self.port.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

pub struct SerialChannel {
    link: Arc<Link>,
    running: AtomicBool,
    hosts: HostSet,
}

impl SerialChannel {
    /// Channel over a serial device, opened on `start`
    pub fn open(name: impl Into<String>, path: impl Into<String>, baud_rate: u32) -> Self {
        let path = path.into();
        Self::with_opener(name, move || {
            let port = serialport::new(path.as_str(), baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(1))
                .open()
                .map_err(|e| ChannelError::Open(format!("{}: {}", path, e)))?;

            info!("Opened serial port: {} at {} baud", path, baud_rate);
            Ok(Box::new(SerialDevice { port }) as Box<dyn LinkPort>)
        })
    }

    /// Channel over an arbitrary port; `opener` is called again whenever the
    /// port has to be reinitialised
    pub fn with_opener<F>(name: impl Into<String>, opener: F) -> Self
    where
        F: Fn() -> Result<Box<dyn LinkPort>, ChannelError> + Send + Sync + 'static,
    {
        Self {
            link: Arc::new(Link {
                name: name.into(),
                opener: Box::new(opener),
                port: Mutex::new(None),
                inbound: Mutex::new(Vec::new()),
                unavailable: AtomicBool::new(false),
            }),
            running: AtomicBool::new(false),
            hosts: HostSet::new(),
        }
    }

    pub fn peer() -> HostId {
        HostId::new(LINK_PEER)
    }

    /// Runs blocking port I/O on the blocking pool
    async fn blocking<T, F>(&self, io: F) -> Option<T>
    where
        F: FnOnce(&Link) -> T + Send + 'static,
        T: Send + 'static,
    {
        let link = self.link.clone();
        match tokio::task::spawn_blocking(move || io(&link)).await {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Link I/O task for {} failed: {}", self.link.name, e);
                None
            }
        }
    }
}

#[async_trait]
impl Channel for SerialChannel {
    fn name(&self) -> &str {
        &self.link.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        // A port that is not there yet is reopened on the next read or write
        self.blocking(|link| {
            let mut port = link.port.lock().unwrap_or_else(|e| e.into_inner());
            link.reopen(&mut port);
        })
        .await;
        self.running.store(true, Ordering::SeqCst);

        // The wired peer is always present
        self.hosts.observe(&Self::peer());
        info!("Serial channel {} started", self.link.name);
        Ok(())
    }

    async fn send(&self, host: &HostId, payload: &str) -> Result<(), ChannelError> {
        if !self.is_running() {
            return Err(ChannelError::NotRunning(self.link.name.clone()));
        }
        if self.hosts.observe(host) {
            debug!("New host {} on {}", host, self.link.name);
        }

        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.extend_from_slice(payload.as_bytes());
        frame.push(b'\n');

        self.blocking(move |link| link.write_frame(&frame)).await;
        Ok(())
    }

    async fn await_message(&self, poll_interval: Duration) -> Option<(HostId, String)> {
        while self.is_running() {
            if let Some(Some(line)) = self.blocking(Link::poll_line).await {
                let host = Self::peer();
                self.hosts.observe(&host);
                return Some((host, line));
            }
            tokio::time::sleep(poll_interval).await;
        }
        None
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.link.close();
        info!("Serial channel {} stopped", self.link.name);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hosts(&self) -> Vec<HostId> {
        self.hosts.snapshot()
    }
}
