use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// What the gateway currently knows about its own links
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub wifi_up: bool,
    pub broker_connected: bool,
}

impl Connectivity {
    /// Creates the state cell. The writer stays with the supervisor tasks.
    pub(crate) fn channel() -> (ConnectivityWriter, watch::Receiver<Connectivity>) {
        let (tx, rx) = watch::channel(Connectivity::default());
        (ConnectivityWriter(Arc::new(tx)), rx)
    }
}

#[derive(Clone)]
pub(crate) struct ConnectivityWriter(Arc<watch::Sender<Connectivity>>);

impl ConnectivityWriter {
    pub fn set_wifi(&self, up: bool) {
        self.0.send_modify(|state| state.wifi_up = up);
        debug!("Connectivity: wifi_up = {}", up);
    }

    pub fn set_broker(&self, connected: bool) {
        self.0.send_modify(|state| state.broker_connected = connected);
        debug!("Connectivity: broker_connected = {}", connected);
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.0.subscribe()
    }
}
