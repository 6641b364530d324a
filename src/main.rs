pub mod channel;
pub mod config;
pub mod gateway;
pub mod mqtt;
pub mod protocol;
pub mod system;

#[cfg(test)]
mod testing;

use crate::channel::{Channel, DatagramChannel, SerialChannel};
use crate::config::{ChannelConfig, GatewayConfig, IndicatorConfig};
use crate::gateway::{Gateway, Supervisor};
use crate::mqtt::{MqttHandler, SubscriptionRegistry};
use crate::system::{
    spawn_heartbeat, GpioIndicator, Heartbeat, Indicator, NoIndicator, NtpClock, ProcMemory,
    ProcessRestart, SysfsNetworkMonitor,
};
use color_eyre::Result;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = GatewayConfig::resolve_path(std::env::args().nth(1))?;
    let config = GatewayConfig::load_or_create(&path).await?;
    setup_logging_env(&config.log_level);
    info!("Using configuration {}", path.display());

    let shutdown = CancellationToken::new();

    if let Some(pin) = config.indicators.heartbeat_led_pin {
        let heartbeat = open_indicator(pin, &config.indicators);
        let _heartbeat_handle = spawn_heartbeat(heartbeat, Heartbeat::default(), shutdown.clone());
    }
    let wifi_led = match config.indicators.wifi_led_pin {
        Some(pin) => open_indicator(pin, &config.indicators),
        None => Arc::new(NoIndicator),
    };

    let (network, _network_handle) = SysfsNetworkMonitor::start(
        &config.network.interface,
        config.network.reach_host.clone(),
        Duration::from_millis(config.network.poll_ms),
        shutdown.clone(),
    );

    let (broker, broker_events) = MqttHandler::new(&config.broker)?;
    let broker = Arc::new(broker);

    let channels = build_channels(&config.channels);
    let gateway = Gateway {
        channels: channels.clone(),
        broker: broker.clone(),
        registry: SubscriptionRegistry::shared(),
        network: Arc::new(network),
        clock: Arc::new(NtpClock::new(
            config.time.server.clone(),
            Duration::from_millis(config.time.window_ms),
        )),
        memory: Arc::new(ProcMemory::default()),
        wifi_led,
        restarter: Arc::new(ProcessRestart::new(config.supervisor.restart_exit_code)),
    };

    let supervisor = Supervisor::create(gateway, config.supervisor_settings(), broker_events);
    info!("Starting gateway with {} channels", channels.len());

    tokio::select! {
        _ = supervisor.run() => warn!("Supervisor stopped"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    let stats = broker.stats();
    shutdown.cancel();
    broker.shutdown();
    for channel in &channels {
        channel.stop();
    }

    info!(
        "Broker traffic: {} received, {} sent, last activity {:?} (connected: {})",
        stats.messages_received, stats.messages_sent, stats.last_activity, stats.connected
    );
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(())
}

fn setup_logging_env(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn build_channels(configs: &[ChannelConfig]) -> Vec<Arc<dyn Channel>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn Channel> {
            match config {
                ChannelConfig::Serial { name, path, baud } => {
                    Arc::new(SerialChannel::open(name.clone(), path.clone(), *baud))
                }
                ChannelConfig::Datagram { name, bind, peers } => {
                    Arc::new(DatagramChannel::new(name.clone(), *bind, peers.clone()))
                }
            }
        })
        .collect()
}

/// Falls back to a silent indicator when GPIO is not available
fn open_indicator(pin: u8, config: &IndicatorConfig) -> Arc<dyn Indicator> {
    match GpioIndicator::open(pin, config.active_low) {
        Ok(indicator) => Arc::new(indicator),
        Err(e) => {
            warn!("LED on GPIO {} unavailable: {}", pin, e);
            Arc::new(NoIndicator)
        }
    }
}
