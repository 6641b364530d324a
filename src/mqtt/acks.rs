//! Matches broker acknowledgements to the requests waiting on them
//!
//! The client hands requests to the event loop in submission order, so the
//! n-th outgoing PUBLISH or SUBSCRIBE belongs to the n-th queued request. Once
//! the event loop reports the packet id, the waiter moves to a per-id table
//! and is resolved by PUBACK, PUBCOMP or SUBACK.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use rumqttc::{Outgoing, Packet, QoS, SubscribeReasonCode};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::BrokerError;

pub(crate) type AckSender = oneshot::Sender<Result<(), BrokerError>>;

/// A request handed to the client whose packet id is not known yet
pub(crate) enum Pending {
    Publish { qos: QoS, reply: AckSender },
    Subscribe { topic: String, reply: AckSender },
}

#[derive(Default)]
struct Waiting {
    queued: VecDeque<Pending>,
    publishes: HashMap<u16, AckSender>,
    subscriptions: HashMap<u16, (String, AckSender)>,
    // Publish held back by the event loop until its packet id is free again
    collided: Option<(u16, AckSender)>,
}

#[derive(Default)]
pub(crate) struct AckTracker {
    waiting: Mutex<Waiting>,
}

impl AckTracker {
    fn lock(&self) -> MutexGuard<'_, Waiting> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn expect(&self, pending: Pending) {
        self.lock().queued.push_back(pending);
    }

    /// Takes back the latest request after the client refused to queue it
    pub fn withdraw(&self) {
        self.lock().queued.pop_back();
    }

    pub fn outgoing(&self, outgoing: &Outgoing) {
        let mut waiting = self.lock();
        match *outgoing {
            Outgoing::Publish(pkid) => {
                if matches!(waiting.collided, Some((held, _)) if held == pkid) {
                    if let Some((pkid, reply)) = waiting.collided.take() {
                        waiting.publishes.insert(pkid, reply);
                    }
                    return;
                }
                let next = waiting.queued.pop_front();
                match next {
                    Some(Pending::Publish {
                        qos: QoS::AtMostOnce,
                        reply,
                    }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Pending::Publish { reply, .. }) => {
                        waiting.publishes.insert(pkid, reply);
                    }
                    Some(other) => {
                        warn!("Outgoing publish {} does not match the queued request", pkid);
                        waiting.queued.push_front(other);
                    }
                    None => debug!("Untracked outgoing publish {}", pkid),
                }
            }
            Outgoing::AwaitAck(pkid) => {
                let next = waiting.queued.pop_front();
                match next {
                    Some(Pending::Publish { reply, .. }) => waiting.collided = Some((pkid, reply)),
                    Some(other) => waiting.queued.push_front(other),
                    None => {}
                }
            }
            Outgoing::Subscribe(pkid) => {
                let next = waiting.queued.pop_front();
                match next {
                    Some(Pending::Subscribe { topic, reply }) => {
                        waiting.subscriptions.insert(pkid, (topic, reply));
                    }
                    Some(other) => {
                        warn!("Outgoing subscribe {} does not match the queued request", pkid);
                        waiting.queued.push_front(other);
                    }
                    None => debug!("Untracked outgoing subscribe {}", pkid),
                }
            }
            _ => {}
        }
    }

    pub fn incoming(&self, packet: &Packet) {
        let mut waiting = self.lock();
        match packet {
            // QoS 1 ends with PUBACK, QoS 2 with PUBCOMP
            Packet::PubAck(ack) => resolve(waiting.publishes.remove(&ack.pkid), Ok(())),
            Packet::PubComp(comp) => resolve(waiting.publishes.remove(&comp.pkid), Ok(())),
            Packet::SubAck(ack) => {
                if let Some((topic, reply)) = waiting.subscriptions.remove(&ack.pkid) {
                    let refused = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let outcome = if refused {
                        Err(BrokerError::Rejected(topic))
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(outcome);
                }
            }
            _ => {}
        }
    }

    /// Fails every waiter; the session they belong to is gone
    pub fn fail_all(&self, reason: &str) {
        let mut waiting = self.lock();
        let mut replies: Vec<AckSender> = waiting
            .queued
            .drain(..)
            .map(|pending| match pending {
                Pending::Publish { reply, .. } | Pending::Subscribe { reply, .. } => reply,
            })
            .collect();
        replies.extend(waiting.publishes.drain().map(|(_, reply)| reply));
        replies.extend(waiting.subscriptions.drain().map(|(_, (_, reply))| reply));
        replies.extend(waiting.collided.take().map(|(_, reply)| reply));

        for reply in replies {
            let _ = reply.send(Err(BrokerError::Request(reason.to_string())));
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        let waiting = self.lock();
        waiting.queued.len()
            + waiting.publishes.len()
            + waiting.subscriptions.len()
            + usize::from(waiting.collided.is_some())
    }
}

fn resolve(reply: Option<AckSender>, outcome: Result<(), BrokerError>) {
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}
