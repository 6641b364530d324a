//! # Gateway Configuration
//!
//! One TOML document describes the whole gateway. It is looked up in this
//! order:
//!
//! 1. the first command line argument
//! 2. `$MQTT_BRIDGE_CONFIG`
//! 3. `<config dir>/mqttbridge/gateway.toml`
//!
//! A missing file is not an error: the defaults are written to the resolved
//! path and used, so a fresh device comes up and can be edited afterwards.
//!
//! ```toml
//! log_level = "info"
//!
//! [broker]
//! url = "broker.local:1883"
//! client_id = "mqttbridge-kitchen"
//!
//! [[channels]]
//! kind = "serial"
//! name = "wired"
//! path = "/dev/ttyAMA0"
//! baud = 115200
//!
//! [[channels]]
//! kind = "datagram"
//! name = "radio"
//! bind = "0.0.0.0:4210"
//! peers = ["192.168.4.2:4210"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::gateway::SupervisorSettings;
use crate::mqtt::MqttConfig;

pub const CONFIG_ENV: &str = "MQTT_BRIDGE_CONFIG";
const CONFIG_DIR: &str = "mqttbridge";
const CONFIG_FILE: &str = "gateway.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine a configuration directory")]
    NoConfigDir,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub log_level: String,
    pub broker: MqttConfig,
    pub time: TimeConfig,
    pub network: NetworkConfig,
    pub supervisor: SupervisorConfig,
    pub indicators: IndicatorConfig,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeConfig {
    /// NTP server as "host:port"
    pub server: String,
    pub window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
    /// Resolved to decide whether the wider network is reachable
    pub reach_host: String,
    pub poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub connect_attempts: u32,
    pub connect_delay_ms: u64,
    pub wifi_settle_ms: u64,
    pub housekeeping_ms: u64,
    pub channel_poll_ms: u64,
    pub restart_exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// BCM pin numbers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_led_pin: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_led_pin: Option<u8>,
    pub active_low: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    Serial {
        name: String,
        path: String,
        baud: u32,
    },
    Datagram {
        name: String,
        bind: SocketAddr,
        #[serde(default)]
        peers: Vec<SocketAddr>,
    },
}

impl ChannelConfig {
    pub fn name(&self) -> &str {
        match self {
            ChannelConfig::Serial { name, .. } | ChannelConfig::Datagram { name, .. } => name,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: MqttConfig::default(),
            time: TimeConfig::default(),
            network: NetworkConfig::default(),
            supervisor: SupervisorConfig::default(),
            indicators: IndicatorConfig::default(),
            channels: vec![
                ChannelConfig::Serial {
                    name: "wired".to_string(),
                    path: "/dev/ttyAMA0".to_string(),
                    baud: 115_200,
                },
                ChannelConfig::Datagram {
                    name: "radio".to_string(),
                    bind: SocketAddr::from(([0, 0, 0, 0], 4210)),
                    peers: Vec::new(),
                },
            ],
        }
    }
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            server: "pool.ntp.org:123".to_string(),
            window_ms: 2_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            reach_host: "pool.ntp.org".to_string(),
            poll_ms: 500,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let defaults = SupervisorSettings::default();
        Self {
            connect_attempts: defaults.connect_attempts,
            connect_delay_ms: defaults.connect_delay.as_millis() as u64,
            wifi_settle_ms: defaults.wifi_settle.as_millis() as u64,
            housekeeping_ms: defaults.housekeeping.as_millis() as u64,
            channel_poll_ms: defaults.channel_poll.as_millis() as u64,
            restart_exit_code: 75,
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            wifi_led_pin: None,
            heartbeat_led_pin: None,
            active_low: true,
        }
    }
}

impl GatewayConfig {
    /// Picks the configuration path from argument, environment or config dir
    pub fn resolve_path(arg: Option<String>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = arg {
            return Ok(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Loads `path`, writing the defaults there first if it does not exist
    pub async fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_error(path, e))?;

        let config = if exists {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| io_error(path, e))?;
            let config: GatewayConfig = toml::from_str(&content)?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            warn!(
                "Configuration file {} does not exist, writing defaults",
                path.display()
            );
            let config = GatewayConfig::default();
            config.save(path).await?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::Invalid("no channels configured".to_string()));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel name {:?}",
                    channel.name()
                )));
            }
        }

        if self.supervisor.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid(
                "keep_alive_secs must be at least 5".to_string(),
            ));
        }
        self.broker
            .server_address()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            connect_attempts: self.supervisor.connect_attempts,
            connect_delay: Duration::from_millis(self.supervisor.connect_delay_ms),
            wifi_settle: Duration::from_millis(self.supervisor.wifi_settle_ms),
            housekeeping: Duration::from_millis(self.supervisor.housekeeping_ms),
            channel_poll: Duration::from_millis(self.supervisor.channel_poll_ms),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = GatewayConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert!(path.exists());

        let reloaded = GatewayConfig::load_or_create(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn partial_document_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
log_level = "debug"

[broker]
url = "broker.local:8883"

[supervisor]
connect_attempts = 3

[[channels]]
kind = "datagram"
name = "radio"
bind = "0.0.0.0:4210"
peers = ["192.168.4.2:4210"]
"#,
        )
        .unwrap();

        let config = GatewayConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.broker.url, "broker.local:8883");
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.supervisor.connect_attempts, 3);
        assert_eq!(config.supervisor.connect_delay_ms, 5_000);
        assert_eq!(
            config.channels,
            vec![ChannelConfig::Datagram {
                name: "radio".to_string(),
                bind: "0.0.0.0:4210".parse().unwrap(),
                peers: vec!["192.168.4.2:4210".parse().unwrap()],
            }]
        );

        let settings = config.supervisor_settings();
        assert_eq!(settings.connect_attempts, 3);
        assert_eq!(settings.channel_poll, Duration::from_millis(20));
    }

    #[test]
    fn validation_rejects_unusable_documents() {
        let mut config = GatewayConfig::default();
        assert!(config.validate().is_ok());

        config.supervisor.connect_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::default();
        config.channels.push(config.channels[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::default();
        config.channels.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::default();
        config.broker.url = "broker.local:notaport".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn explicit_argument_wins_path_resolution() {
        let path = GatewayConfig::resolve_path(Some("/etc/mqttbridge.toml".to_string())).unwrap();
        assert_eq!(path, PathBuf::from("/etc/mqttbridge.toml"));
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "channels = 7").unwrap();

        assert!(matches!(
            GatewayConfig::load_or_create(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
