//! # System Collaborators
//!
//! Host-OS facilities the gateway consumes but does not own: network state,
//! wall-clock time from a time server, memory figures, status LEDs and the
//! restart primitive. Each one sits behind a small trait so the gateway can be
//! driven by in-memory doubles in tests.
//!
//! ```text
//! system/
//! ├── network.rs    - Wi-Fi state stream and reachability check
//! ├── time.rs       - NTP query
//! ├── memory.rs     - /proc based memory figures
//! ├── indicator.rs  - GPIO status LEDs and heartbeat
//! └── restart.rs    - process restart
//! ```

pub mod indicator;
pub mod memory;
pub mod network;
pub mod restart;
pub mod time;

pub use indicator::{spawn_heartbeat, GpioIndicator, Heartbeat, IndicatorError, NoIndicator};
pub use memory::{MemoryUsage, ProcMemory};
pub use network::SysfsNetworkMonitor;
pub use restart::ProcessRestart;
pub use time::{NtpClock, TimeError};

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Wi-Fi up/down as a watch stream; the current value is the initial state
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// Whether the wider network answers at all
    async fn is_reachable(&self) -> bool;
}

#[async_trait]
pub trait TimeSource: Send + Sync {
    /// Current Unix time in seconds
    async fn now(&self) -> Result<u64, TimeError>;
}

#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn usage(&self) -> std::io::Result<MemoryUsage>;
}

pub trait Indicator: Send + Sync {
    fn set(&self, on: bool);
}

pub trait Restarter: Send + Sync {
    /// Brings the gateway down for a restart. Production implementations
    /// do not return.
    fn restart(&self);
}
