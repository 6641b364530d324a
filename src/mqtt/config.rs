use serde::{Deserialize, Serialize};

use super::BrokerError;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker address as "host:port"; the port defaults to 1883
    pub url: String,
    pub user: String,
    pub pw: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// How long a connection attempt or a broker acknowledgement may take
    pub connect_timeout_ms: u64,
    /// Capacity of the request and event queues
    pub capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "localhost:1883".to_string(),
            user: String::new(),
            pw: String::new(),
            client_id: "mqttbridge".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 10_000,
            capacity: 100,
        }
    }
}

impl MqttConfig {
    /// Splits `url` into host and port
    pub fn server_address(&self) -> Result<(String, u16), BrokerError> {
        let mut server_comps = self.url.splitn(2, ':');
        let host = server_comps.next().unwrap_or_default().trim();
        if host.is_empty() {
            return Err(BrokerError::Config(format!("missing host in {:?}", self.url)));
        }

        let port = match server_comps.next() {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| BrokerError::Config(format!("invalid port in {:?}", self.url)))?,
            None => 1883,
        };
        Ok((host.to_string(), port))
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty()
    }
}
