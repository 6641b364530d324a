//! Minimal SNTP client
//!
//! One 48-byte request, one reply, transmit-timestamp seconds only. Good
//! enough to hand hosts a wall-clock second; no drift or delay correction.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use super::TimeSource;

pub const NTP_PACKET_LEN: usize = 48;
/// LI = 0, VN = 3, Mode = 3 (client)
pub const NTP_QUERY_HEADER: u8 = 0x1b;
/// Seconds between 1900-01-01 and 1970-01-01
pub const NTP_UNIX_DELTA: u64 = 2_208_988_800;
/// Anything earlier is a clock that was never set
pub const MIN_PLAUSIBLE_UNIX: u64 = 1_451_260_800;

const TRANSMIT_SECONDS: std::ops::Range<usize> = 40..44;

#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("Time server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("No reply from time server within {0:?}")]
    Timeout(Duration),

    #[error("Time server reply too short: {0} bytes")]
    ShortReply(usize),

    #[error("Time server returned implausible time {0}")]
    Implausible(u64),
}

pub struct NtpClock {
    server: String,
    window: Duration,
    // One query in flight at a time
    query: Mutex<()>,
}

impl NtpClock {
    /// `server` is "host:port"; `window` bounds the wait for the reply
    pub fn new(server: impl Into<String>, window: Duration) -> Self {
        Self {
            server: server.into(),
            window,
            query: Mutex::new(()),
        }
    }

    async fn exchange(&self) -> Result<u64, TimeError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.server.as_str()).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        request[0] = NTP_QUERY_HEADER;
        socket.send(&request).await?;

        let mut reply = [0u8; NTP_PACKET_LEN];
        let n = tokio::time::timeout(self.window, socket.recv(&mut reply))
            .await
            .map_err(|_| TimeError::Timeout(self.window))??;
        parse_ntp_reply(&reply[..n])
    }
}

#[async_trait]
impl TimeSource for NtpClock {
    async fn now(&self) -> Result<u64, TimeError> {
        let _guard = self.query.lock().await;
        let now = self.exchange().await?;
        debug!(
            "Time server {} reports {}",
            self.server,
            chrono::DateTime::from_timestamp(now as i64, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        );
        Ok(now)
    }
}

/// Extracts Unix seconds from an NTP reply
pub fn parse_ntp_reply(reply: &[u8]) -> Result<u64, TimeError> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(TimeError::ShortReply(reply.len()));
    }
    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&reply[TRANSMIT_SECONDS]);
    let ntp_seconds = u64::from(u32::from_be_bytes(seconds));

    let unix = ntp_seconds
        .checked_sub(NTP_UNIX_DELTA)
        .ok_or(TimeError::Implausible(ntp_seconds))?;
    if unix < MIN_PLAUSIBLE_UNIX {
        return Err(TimeError::Implausible(unix));
    }
    Ok(unix)
}
