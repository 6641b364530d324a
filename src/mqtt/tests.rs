use super::acks::{AckTracker, Pending};
use super::*;
use crate::channel::{Channel, HostId};
use crate::testing::{eventually, Journal, MockChannel};
use rumqttc::{Outgoing, Packet, PubAck, PubComp, QoS, SubAck, SubscribeReasonCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

fn subscriber(channel: &Arc<MockChannel>, host: &str, qos: QoS) -> Subscriber {
    Subscriber::new(channel.clone(), HostId::new(host), qos)
}

fn targets(subscribers: &[Subscriber]) -> Vec<(String, String)> {
    subscribers
        .iter()
        .map(|s| (s.channel.name().to_string(), s.host.to_string()))
        .collect()
}

#[test]
fn server_address_splits_host_and_port() {
    let mut config = MqttConfig {
        url: "broker.local:8883".to_string(),
        ..Default::default()
    };
    assert_eq!(
        config.server_address().unwrap(),
        ("broker.local".to_string(), 8883)
    );

    config.url = "broker.local".to_string();
    assert_eq!(config.server_address().unwrap().1, 1883);

    config.url = "broker.local:mqtt".to_string();
    assert!(matches!(config.server_address(), Err(BrokerError::Config(_))));

    config.url = ":1883".to_string();
    assert!(!config.server_address().unwrap_err().is_retryable());
}

#[test]
fn broker_message_becomes_subscription_notice() {
    let message = BrokerMessage::new("sensors/temp", "22.0", true);
    assert_eq!(message.to_notice().encode(), "SUBSCRIPTION,sensors/temp,22.0,True");
    assert!(message.to_string().ends_with("sensors/temp: 22.0"));
}

#[test]
fn registry_keeps_first_entry_per_target() {
    let journal = Journal::default();
    let wired = MockChannel::new("wired", &journal);
    let mut registry = SubscriptionRegistry::new();

    assert!(registry.record("sensors/temp", subscriber(&wired, "link", QoS::AtMostOnce)));
    assert!(!registry.record("sensors/temp", subscriber(&wired, "link", QoS::ExactlyOnce)));
    assert!(registry.record("sensors/humidity", subscriber(&wired, "link", QoS::AtLeastOnce)));

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.subscribers_of("sensors/temp")[0].qos, QoS::AtMostOnce);
}

#[test]
fn hosts_with_equal_ids_on_different_channels_are_distinct() {
    let journal = Journal::default();
    let wired = MockChannel::new("wired", &journal);
    let radio = MockChannel::new("radio", &journal);
    let mut registry = SubscriptionRegistry::new();

    registry.record("t", subscriber(&wired, "h", QoS::AtMostOnce));
    registry.record("t", subscriber(&radio, "h", QoS::AtMostOnce));

    assert_eq!(
        targets(&registry.subscribers_of("t")),
        vec![
            ("wired".to_string(), "h".to_string()),
            ("radio".to_string(), "h".to_string())
        ]
    );
}

#[test]
fn lookup_honours_wildcards_and_deduplicates() {
    let journal = Journal::default();
    let radio = MockChannel::new("radio", &journal);
    let mut registry = SubscriptionRegistry::new();

    registry.record("sensors/#", subscriber(&radio, "a", QoS::AtMostOnce));
    registry.record("sensors/+/temp", subscriber(&radio, "b", QoS::AtMostOnce));
    registry.record("sensors/kitchen/temp", subscriber(&radio, "a", QoS::AtMostOnce));
    registry.record("garden/temp", subscriber(&radio, "c", QoS::AtMostOnce));

    assert_eq!(
        targets(&registry.subscribers_of("sensors/kitchen/temp")),
        vec![
            ("radio".to_string(), "a".to_string()),
            ("radio".to_string(), "b".to_string())
        ]
    );
    assert!(registry.subscribers_of("garden/humidity").is_empty());
}

#[test]
fn entries_replay_in_registration_order() {
    let journal = Journal::default();
    let wired = MockChannel::new("wired", &journal);
    let mut registry = SubscriptionRegistry::new();

    registry.record("b", subscriber(&wired, "h1", QoS::AtMostOnce));
    registry.record("a", subscriber(&wired, "h1", QoS::AtLeastOnce));
    registry.record("b", subscriber(&wired, "h2", QoS::ExactlyOnce));

    let replay: Vec<(String, QoS)> = registry
        .entries()
        .into_iter()
        .map(|(topic, s)| (topic, s.qos))
        .collect();
    assert_eq!(
        replay,
        vec![
            ("b".to_string(), QoS::AtMostOnce),
            ("a".to_string(), QoS::AtLeastOnce),
            ("b".to_string(), QoS::ExactlyOnce)
        ]
    );
    assert_eq!(registry.topics(), vec!["b".to_string(), "a".to_string()]);

    registry.compact();
    assert_eq!(registry.len(), 3);
}

#[test]
fn acks_resolve_by_packet_id_in_submission_order() {
    let acks = AckTracker::default();
    let (qos0, mut qos0_rx) = oneshot::channel();
    let (qos1, mut qos1_rx) = oneshot::channel();
    let (sub, mut sub_rx) = oneshot::channel();
    acks.expect(Pending::Publish {
        qos: QoS::AtMostOnce,
        reply: qos0,
    });
    acks.expect(Pending::Publish {
        qos: QoS::AtLeastOnce,
        reply: qos1,
    });
    acks.expect(Pending::Subscribe {
        topic: "a/b".to_string(),
        reply: sub,
    });

    acks.outgoing(&Outgoing::Publish(0));
    assert!(matches!(qos0_rx.try_recv(), Ok(Ok(()))));

    acks.outgoing(&Outgoing::Publish(1));
    acks.outgoing(&Outgoing::Subscribe(2));
    assert!(qos1_rx.try_recv().is_err());
    assert!(sub_rx.try_recv().is_err());

    acks.incoming(&Packet::SubAck(SubAck::new(
        2,
        vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
    )));
    acks.incoming(&Packet::PubAck(PubAck::new(1)));
    assert!(matches!(sub_rx.try_recv(), Ok(Ok(()))));
    assert!(matches!(qos1_rx.try_recv(), Ok(Ok(()))));
    assert_eq!(acks.outstanding(), 0);
}

#[test]
fn refused_subscription_and_lost_session_fail_waiters() {
    let acks = AckTracker::default();
    let (sub, mut sub_rx) = oneshot::channel();
    let (qos2, mut qos2_rx) = oneshot::channel();
    acks.expect(Pending::Subscribe {
        topic: "denied/#".to_string(),
        reply: sub,
    });
    acks.expect(Pending::Publish {
        qos: QoS::ExactlyOnce,
        reply: qos2,
    });

    acks.outgoing(&Outgoing::Subscribe(7));
    acks.incoming(&Packet::SubAck(SubAck::new(7, vec![SubscribeReasonCode::Failure])));
    assert!(matches!(sub_rx.try_recv(), Ok(Err(BrokerError::Rejected(t))) if t == "denied/#"));

    acks.outgoing(&Outgoing::Publish(8));
    acks.incoming(&Packet::PubAck(PubAck::new(9)));
    assert!(qos2_rx.try_recv().is_err());
    acks.fail_all("connection reset");
    assert!(matches!(qos2_rx.try_recv(), Ok(Err(BrokerError::Request(_)))));
    assert_eq!(acks.outstanding(), 0);
}

#[test]
fn collided_publish_waits_for_its_own_ack() {
    let acks = AckTracker::default();
    let (first, mut first_rx) = oneshot::channel();
    let (second, mut second_rx) = oneshot::channel();
    acks.expect(Pending::Publish {
        qos: QoS::AtLeastOnce,
        reply: first,
    });
    acks.expect(Pending::Publish {
        qos: QoS::AtLeastOnce,
        reply: second,
    });

    acks.outgoing(&Outgoing::Publish(3));
    acks.outgoing(&Outgoing::AwaitAck(3));
    acks.incoming(&Packet::PubAck(PubAck::new(3)));
    assert!(matches!(first_rx.try_recv(), Ok(Ok(()))));
    assert!(second_rx.try_recv().is_err());

    acks.outgoing(&Outgoing::Publish(3));
    acks.incoming(&Packet::PubComp(PubComp::new(3)));
    assert!(matches!(second_rx.try_recv(), Ok(Ok(()))));
}

/// How the scripted broker behaves after the client's CONNECT
#[derive(Clone, Copy)]
enum Script {
    /// Never answers the CONNECT
    Mute,
    /// Rejects the CONNECT as not authorised
    Refuse,
    /// Accepts, then swallows every request
    Silent,
    /// Accepts and acknowledges; filters under `denied/` are refused
    Acknowledge,
    /// Accepts, delivers one message and hangs up
    DeliverAndClose,
}

const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const CONNACK_NOT_AUTHORISED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await.ok()?;
        length |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn packet_id(bytes: &[u8]) -> [u8; 2] {
    [bytes[0], bytes[1]]
}

async fn acknowledge(stream: &mut TcpStream) {
    while let Some((header, body)) = read_packet(stream).await {
        let reply = match header >> 4 {
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                let id = packet_id(&body[2 + topic_len..]);
                match qos {
                    1 => vec![0x40, 0x02, id[0], id[1]],
                    2 => vec![0x50, 0x02, id[0], id[1]],
                    _ => continue,
                }
            }
            // PUBREL
            6 => {
                let id = packet_id(&body);
                vec![0x70, 0x02, id[0], id[1]]
            }
            8 => {
                let id = packet_id(&body);
                let filter_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
                let filter = String::from_utf8_lossy(&body[4..4 + filter_len]);
                let code = if filter.starts_with("denied/") { 0x80 } else { 0x01 };
                vec![0x90, 0x03, id[0], id[1], code]
            }
            // PINGREQ
            12 => vec![0xd0, 0x00],
            _ => continue,
        };
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }
}

async fn scripted_broker(script: Script) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // CONNECT
        read_packet(&mut stream).await.unwrap();
        match script {
            Script::Mute => {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Script::Refuse => {
                stream.write_all(&CONNACK_NOT_AUTHORISED).await.unwrap();
            }
            Script::Silent => {
                stream.write_all(&CONNACK_OK).await.unwrap();
                while read_packet(&mut stream).await.is_some() {}
            }
            Script::Acknowledge => {
                stream.write_all(&CONNACK_OK).await.unwrap();
                acknowledge(&mut stream).await;
            }
            Script::DeliverAndClose => {
                stream.write_all(&CONNACK_OK).await.unwrap();
                let mut publish = vec![0x30, 18, 0x00, 12];
                publish.extend_from_slice(b"sensors/temp");
                publish.extend_from_slice(b"22.0");
                stream.write_all(&publish).await.unwrap();
                stream.flush().await.unwrap();
            }
        }
    });
    addr
}

async fn handler_for(
    script: Script,
    timeout_ms: u64,
) -> (MqttHandler, tokio::sync::mpsc::Receiver<BrokerEvent>) {
    let addr = scripted_broker(script).await;
    let config = MqttConfig {
        url: addr.to_string(),
        keep_alive_secs: 5,
        connect_timeout_ms: timeout_ms,
        ..Default::default()
    };
    MqttHandler::new(&config).unwrap()
}

#[tokio::test]
async fn handler_forwards_publishes_then_reports_loss() {
    let (handler, mut events) = handler_for(Script::DeliverAndClose, 1000).await;
    handler.connect().await.unwrap();
    assert!(handler.is_connected());

    match events.recv().await {
        Some(BrokerEvent::Message(message)) => {
            assert_eq!(message.topic, "sensors/temp");
            assert_eq!(message.payload, "22.0");
            assert!(!message.retain);
        }
        other => panic!("expected a message, got {:?}", other),
    }
    assert!(matches!(events.recv().await, Some(BrokerEvent::ConnectionLost(_))));
    assert!(!handler.is_connected());

    let stats = handler.stats();
    assert_eq!(stats.messages_received, 1);
    assert!(!stats.connected);
    assert!(matches!(
        handler.publish("a", "1", false, QoS::AtMostOnce).await,
        Err(BrokerError::NotConnected)
    ));
}

#[tokio::test]
async fn refused_session_is_reported_as_refused() {
    let (handler, _events) = handler_for(Script::Refuse, 1000).await;
    assert!(matches!(handler.connect().await, Err(BrokerError::Refused(_))));
    assert!(!handler.is_connected());
}

#[tokio::test]
async fn unanswered_connect_times_out() {
    let (handler, _events) = handler_for(Script::Mute, 50).await;
    assert!(matches!(handler.connect().await, Err(BrokerError::Timeout(_))));
    assert!(!handler.is_connected());
}

#[tokio::test]
async fn requests_without_acknowledgement_fail() {
    let (handler, _events) = handler_for(Script::Silent, 200).await;
    handler.connect().await.unwrap();

    assert!(handler
        .publish("sensors/temp", "21.5", false, QoS::AtMostOnce)
        .await
        .is_ok());
    assert!(matches!(
        handler
            .publish("sensors/temp", "21.5", false, QoS::AtLeastOnce)
            .await,
        Err(BrokerError::Timeout(_))
    ));
    assert!(matches!(
        handler.subscribe("a/b", QoS::AtLeastOnce).await,
        Err(BrokerError::Timeout(_))
    ));
    assert_eq!(handler.stats().messages_sent, 1);
    handler.shutdown();
}

#[tokio::test]
async fn acknowledged_requests_succeed_and_refusals_fail() {
    let (handler, _events) = handler_for(Script::Acknowledge, 1000).await;
    handler.connect().await.unwrap();

    handler
        .publish("sensors/temp", "21.5", false, QoS::AtLeastOnce)
        .await
        .unwrap();
    handler
        .publish("sensors/temp", "21.6", true, QoS::ExactlyOnce)
        .await
        .unwrap();
    handler.subscribe("sensors/#", QoS::AtLeastOnce).await.unwrap();
    assert!(matches!(
        handler.subscribe("denied/topic", QoS::AtMostOnce).await,
        Err(BrokerError::Rejected(topic)) if topic == "denied/topic"
    ));

    assert_eq!(handler.stats().messages_sent, 2);
    handler.shutdown();
    assert!(eventually(|| !handler.is_connected()).await);
}
