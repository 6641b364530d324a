//! In-memory doubles for the gateway's collaborators

use async_trait::async_trait;
use rumqttc::QoS;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::channel::{Channel, ChannelError, HostId, HostSet};
use crate::mqtt::{BrokerClient, BrokerError};
use crate::system::{
    Indicator, MemoryProbe, MemoryUsage, NetworkMonitor, Restarter, TimeError, TimeSource,
};

/// Ordered record of externally visible effects, shared between doubles
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// Polls `condition` until it holds or a second has passed
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

pub struct MockChannel {
    name: String,
    inbound: Mutex<VecDeque<(HostId, String)>>,
    sent: Mutex<Vec<(HostId, String)>>,
    running: AtomicBool,
    hosts: HostSet,
    journal: Journal,
}

impl MockChannel {
    pub fn new(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            hosts: HostSet::new(),
            journal: journal.clone(),
        })
    }

    /// Queues a line as if `host` had sent it
    pub fn inject(&self, host: &str, line: &str) {
        self.inbound
            .lock()
            .unwrap()
            .push_back((HostId::new(host), line.to_string()));
    }

    /// Makes `host` known without any traffic
    pub fn know(&self, host: &str) {
        self.hosts.observe(&HostId::new(host));
    }

    pub fn sent_to(&self, host: &str) -> Vec<String> {
        let host = HostId::new(host);
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == host)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ChannelError> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, host: &HostId, payload: &str) -> Result<(), ChannelError> {
        if !self.is_running() {
            return Err(ChannelError::NotRunning(self.name.clone()));
        }
        self.hosts.observe(host);
        self.journal
            .push(format!("{}:{} <- {}", self.name, host, payload));
        self.sent
            .lock()
            .unwrap()
            .push((host.clone(), payload.to_string()));
        Ok(())
    }

    async fn await_message(&self, poll_interval: Duration) -> Option<(HostId, String)> {
        while self.is_running() {
            let next = self.inbound.lock().unwrap().pop_front();
            if let Some((host, line)) = next {
                self.hosts.observe(&host);
                return Some((host, line));
            }
            tokio::time::sleep(poll_interval).await;
        }
        None
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn hosts(&self) -> Vec<HostId> {
        self.hosts.snapshot()
    }
}

#[derive(Default)]
pub struct MockBroker {
    journal: Journal,
    connected: AtomicBool,
    connects: AtomicUsize,
    /// Connect attempts still to fail; `usize::MAX` fails forever
    failing_connects: AtomicUsize,
    fail_requests: AtomicBool,
    pub published: Mutex<Vec<(String, String, bool, QoS)>>,
    pub subscribed: Mutex<Vec<(String, QoS)>>,
}

impl MockBroker {
    pub fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            ..Default::default()
        })
    }

    pub fn fail_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            if failing != usize::MAX {
                self.failing_connects.store(failing - 1, Ordering::SeqCst);
            }
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.journal.push("connect");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
        qos: QoS,
    ) -> Result<(), BrokerError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(BrokerError::Request("broker hiccup".to_string()));
        }
        self.journal.push(format!("publish {}", topic));
        self.published.lock().unwrap().push((
            topic.to_string(),
            payload.to_string(),
            retain,
            qos,
        ));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(BrokerError::Request("broker hiccup".to_string()));
        }
        self.journal.push(format!("subscribe {}", topic));
        self.subscribed
            .lock()
            .unwrap()
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct MockNetwork {
    wifi: watch::Sender<bool>,
    reachable: AtomicBool,
}

impl MockNetwork {
    pub fn new(wifi_up: bool) -> Arc<Self> {
        let (wifi, _) = watch::channel(wifi_up);
        Arc::new(Self {
            wifi,
            reachable: AtomicBool::new(wifi_up),
        })
    }

    pub fn set_wifi(&self, up: bool) {
        self.wifi.send_replace(up);
        self.reachable.store(up, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkMonitor for MockNetwork {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.wifi.subscribe()
    }

    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Clock answering with a fixed time, or timing out when `None`
pub struct FixedClock {
    now: Option<u64>,
    pub queries: AtomicUsize,
}

impl FixedClock {
    pub fn new(now: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            now,
            queries: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TimeSource for FixedClock {
    async fn now(&self) -> Result<u64, TimeError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.now
            .ok_or(TimeError::Timeout(Duration::from_millis(1)))
    }
}

pub struct FixedMemory(pub MemoryUsage);

#[async_trait]
impl MemoryProbe for FixedMemory {
    async fn usage(&self) -> std::io::Result<MemoryUsage> {
        Ok(self.0)
    }
}

#[derive(Default)]
pub struct RecordingIndicator {
    pub states: Mutex<Vec<bool>>,
}

impl Indicator for RecordingIndicator {
    fn set(&self, on: bool) {
        self.states.lock().unwrap().push(on);
    }
}

#[derive(Default)]
pub struct CountingRestarter {
    journal: Journal,
    restarts: AtomicUsize,
}

impl CountingRestarter {
    pub fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            restarts: AtomicUsize::new(0),
        })
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Restarter for CountingRestarter {
    fn restart(&self) {
        self.journal.push("restart");
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}
