//! In-Process Transport
//!
//! A broker double living in the same process. It records subscriptions and
//! publishes, and lets callers deliver messages or drop and restore the link
//! to exercise the connection manager without a network.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{EventStream, Transport, TransportEvent};
use crate::error::{ConnectionError, PublishError, SubscriptionError};
use crate::protocol::{Ack, Message, QoS};
use crate::topic::{shared_filter_target, topic_matches_filter};

#[derive(Default)]
struct Inner {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    started: bool,
    connected: bool,
    closed: bool,
    refuse_connect: Option<String>,
    hold_handshake: bool,
    reject_subscribes: usize,
    subscriptions: Vec<(String, QoS)>,
    subscribe_calls: usize,
    published: Vec<Message>,
    loopback: bool,
    publish_delay: Duration,
    next_packet_id: u16,
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|(filter, _)| topic_matches_filter(topic, shared_filter_target(filter)))
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }
}

/// In-memory transport
#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo publishes back to matching subscriptions, like a real broker
    pub fn with_loopback(self) -> Self {
        self.inner.lock().loopback = true;
        self
    }

    /// Answer the handshake with a refusal
    pub fn refuse_connect(self, reason: impl Into<String>) -> Self {
        self.inner.lock().refuse_connect = Some(reason.into());
        self
    }

    /// Never answer the handshake until [`MemoryTransport::restore_link`]
    pub fn hold_handshake(self) -> Self {
        self.inner.lock().hold_handshake = true;
        self
    }

    /// Reject the next `count` subscribe requests
    pub fn reject_next_subscribes(self, count: usize) -> Self {
        self.inner.lock().reject_subscribes = count;
        self
    }

    /// Hold every publish for `delay` before acknowledging it
    pub fn with_publish_delay(self, delay: Duration) -> Self {
        self.inner.lock().publish_delay = delay;
        self
    }

    /// Deliver a message if it matches an active subscription.
    ///
    /// Returns whether it was delivered.
    pub fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let inner = self.inner.lock();
        if !inner.connected || !inner.is_subscribed(topic) {
            return false;
        }
        inner.emit(TransportEvent::Message(Message::new(topic, payload)));
        true
    }

    /// Deliver a message regardless of subscriptions
    pub fn inject(&self, message: Message) {
        self.inner.lock().emit(TransportEvent::Message(message));
    }

    /// Lose the link. The broker forgets the subscriptions (clean session).
    pub fn drop_link(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.subscriptions.clear();
        inner.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Come back after [`MemoryTransport::drop_link`]
    pub fn restore_link(&self) {
        let mut inner = self.inner.lock();
        inner.connected = true;
        inner.emit(TransportEvent::Connected {
            session_present: false,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<Message> {
        self.inner.lock().published.clone()
    }

    /// Active subscriptions
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.lock().subscriptions.clone()
    }

    /// Subscribe requests seen, rejected ones included
    pub fn subscribe_calls(&self) -> usize {
        self.inner.lock().subscribe_calls
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<EventStream, ConnectionError> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Err(ConnectionError::AlreadyStarted);
        }
        inner.started = true;

        let (tx, rx) = mpsc::unbounded_channel();
        inner.events = Some(tx);

        match inner.refuse_connect.clone() {
            Some(reason) => inner.emit(TransportEvent::Disconnected { reason }),
            None if inner.hold_handshake => {}
            None => {
                inner.connected = true;
                inner.emit(TransportEvent::Connected {
                    session_present: false,
                });
            }
        }
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.lock();
        inner.subscribe_calls += 1;

        if !inner.connected {
            return Err(SubscriptionError::Transport {
                filter: filter.to_string(),
                reason: "not connected".to_string(),
            });
        }
        if inner.reject_subscribes > 0 {
            inner.reject_subscribes -= 1;
            return Err(SubscriptionError::Rejected(filter.to_string()));
        }

        inner.subscriptions.retain(|(existing, _)| existing != filter);
        inner.subscriptions.push((filter.to_string(), qos));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, PublishError> {
        let delay = self.inner.lock().publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(PublishError::Transport {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            });
        }

        let message = Message {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };
        if inner.loopback && inner.is_subscribed(topic) {
            inner.emit(TransportEvent::Message(message.clone()));
        }
        inner.published.push(message);

        let packet_id = match qos {
            QoS::AtMostOnce => 0,
            _ => inner.next_packet_id(),
        };
        Ok(Ack { packet_id, qos })
    }

    async fn disconnect(&self, _grace: Duration) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.connected = false;
        inner.subscriptions.clear();
        inner.emit(TransportEvent::Closed);
        inner.events = None;
    }
}
