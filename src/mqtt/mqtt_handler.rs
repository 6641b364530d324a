use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::acks::{AckTracker, Pending};
use super::config::MqttConfig;
use super::message_manager::BrokerMessage;
use super::{BrokerClient, BrokerError, BrokerEvent};

/// Traffic counters for the current process
#[derive(Clone, Debug, Default)]
pub struct MqttStats {
    pub connected: bool,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

/// One broker session: a fresh client and event loop per `connect`
struct Session {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    token: CancellationToken,
    // Waiters must be queued in the order requests reach the event loop
    submit: AsyncMutex<()>,
}

pub struct MqttHandler {
    options: MqttOptions,
    capacity: usize,
    events: mpsc::Sender<BrokerEvent>,
    session: Mutex<Option<Arc<Session>>>,
    connected: Arc<AtomicBool>,
    received: Arc<AtomicUsize>,
    sent: AtomicUsize,
    last_activity: Arc<Mutex<Option<DateTime<Local>>>>,
    connect_timeout: Duration,
}

impl MqttHandler {
    /// Prepares the client settings; nothing touches the network until `connect`
    pub fn new(config: &MqttConfig) -> Result<(Self, mpsc::Receiver<BrokerEvent>), BrokerError> {
        let (host, port) = config.server_address()?;
        let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .set_clean_session(true);
        if config.has_credentials() {
            mqtt_options.set_credentials(config.user.clone(), config.pw.clone());
        }

        let (events, events_rx) = mpsc::channel(config.capacity);

        let handler = MqttHandler {
            options: mqtt_options,
            capacity: config.capacity,
            events,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            received: Arc::new(AtomicUsize::new(0)),
            sent: AtomicUsize::new(0),
            last_activity: Arc::new(Mutex::new(None)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        };
        Ok((handler, events_rx))
    }

    pub fn stats(&self) -> MqttStats {
        MqttStats {
            connected: self.connected.load(Ordering::SeqCst),
            messages_received: self.received.load(Ordering::Relaxed),
            messages_sent: self.sent.load(Ordering::Relaxed),
            last_activity: *self
                .last_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Stops the event pump of the current session
    pub fn shutdown(&self) {
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            session.token.cancel();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Local::now());
    }

    fn current(&self) -> Result<Arc<Session>, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    /// Waits for the acknowledgement, at most as long as a connect may take
    async fn acknowledged(
        &self,
        ack: oneshot::Receiver<Result<(), BrokerError>>,
    ) -> Result<(), BrokerError> {
        match tokio::time::timeout(self.connect_timeout, ack).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::Request(
                "session ended before acknowledgement".to_string(),
            )),
            Err(_) => Err(BrokerError::Timeout(self.connect_timeout)),
        }
    }

    /// Polls the event loop until the broker acknowledges the session
    async fn handshake(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(());
                    }
                    return Err(BrokerError::Refused(format!("{:?}", ack.code)));
                }
                Ok(event) => debug!("Event before ConnAck: {:?}", event),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(BrokerError::Refused(format!("{:?}", code)))
                }
                Err(e) => return Err(BrokerError::Connect(e.to_string())),
            }
        }
    }

    fn spawn_pump(
        &self,
        mut eventloop: EventLoop,
        acks: Arc<AckTracker>,
        token: CancellationToken,
    ) {
        let events = self.events.clone();
        let connected = self.connected.clone();
        let received = self.received.clone();
        let last_activity = self.last_activity.clone();

        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Broker event pump cancelled");
                        acks.fail_all("session closed");
                        break;
                    }
                    polled = eventloop.poll() => polled,
                };

                match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        received.fetch_add(1, Ordering::Relaxed);
                        *last_activity.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(Local::now());
                        let message = BrokerMessage::new(
                            publish.topic,
                            String::from_utf8_lossy(&publish.payload).into_owned(),
                            publish.retain,
                        );
                        debug!("Received {}", message);
                        if events.send(BrokerEvent::Message(message)).await.is_err() {
                            warn!("Broker event receiver dropped, stopping pump");
                            acks.fail_all("event receiver dropped");
                            break;
                        }
                    }
                    Ok(Event::Incoming(packet)) => acks.incoming(&packet),
                    Ok(Event::Outgoing(outgoing)) => acks.outgoing(&outgoing),
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!("Broker connection lost: {}", e);
                        acks.fail_all(&e.to_string());
                        let _ = events.send(BrokerEvent::ConnectionLost(e.to_string())).await;
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl BrokerClient for MqttHandler {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.shutdown();

        // A fresh event loop never replays requests from an earlier session
        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), self.capacity);
        match tokio::time::timeout(self.connect_timeout, Self::handshake(&mut eventloop)).await {
            Ok(result) => result?,
            Err(_) => return Err(BrokerError::Timeout(self.connect_timeout)),
        }

        let session = Arc::new(Session {
            client,
            acks: Arc::new(AckTracker::default()),
            token: CancellationToken::new(),
            submit: AsyncMutex::new(()),
        });
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.touch();
        info!("Connected to broker");

        self.spawn_pump(eventloop, session.acks.clone(), session.token.clone());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
        qos: QoS,
    ) -> Result<(), BrokerError> {
        let session = self.current()?;
        let (reply, ack) = oneshot::channel();
        {
            let _order = session.submit.lock().await;
            session.acks.expect(Pending::Publish { qos, reply });
            if let Err(e) = session
                .client
                .publish(topic, qos, retain, payload.as_bytes().to_vec())
                .await
            {
                session.acks.withdraw();
                return Err(BrokerError::Request(e.to_string()));
            }
        }
        self.acknowledged(ack).await?;

        self.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        let session = self.current()?;
        let (reply, ack) = oneshot::channel();
        {
            let _order = session.submit.lock().await;
            session.acks.expect(Pending::Subscribe {
                topic: topic.to_string(),
                reply,
            });
            if let Err(e) = session.client.subscribe(topic, qos).await {
                session.acks.withdraw();
                return Err(BrokerError::Request(e.to_string()));
            }
        }
        self.acknowledged(ack).await?;

        debug!("Subscribed to {} at {:?}", topic, qos);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
