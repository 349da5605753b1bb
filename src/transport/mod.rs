//! Transport Layer
//!
//! The seam between the relay and the MQTT client library. The connection
//! manager only ever talks to a [`Transport`]; `MqttTransport` drives a real
//! broker session, `MemoryTransport` is an in-process double.

mod memory;
mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{ConnectionError, PublishError, SubscriptionError};
use crate::protocol::{Ack, Message, QoS};

/// Something the transport observed on the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// CONNACK accepted; emitted for the initial connect and every reconnect
    Connected { session_present: bool },
    /// Link lost; the transport may be reconnecting in the background
    Disconnected { reason: String },
    /// Inbound message on a subscribed topic
    Message(Message),
    /// The transport stopped for good; no further events follow
    Closed,
}

/// Events in the order the transport saw them.
///
/// Unbounded so a slow consumer never stalls the network driver; the
/// consumer only spawns per-message work.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Client-side MQTT link
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start driving the link and hand back its event stream.
    ///
    /// Only callable once. The first `Connected` on the stream completes the
    /// handshake; with auto-reconnect the transport keeps reconnecting after
    /// link loss and emits `Connected` again each time.
    async fn connect(&self) -> Result<EventStream, ConnectionError>;

    /// Subscribe and wait for the broker's SUBACK
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SubscriptionError>;

    /// Publish and wait for the transport acknowledgment
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, PublishError>;

    /// Disconnect, giving in-flight acknowledgments up to `grace`.
    ///
    /// Idempotent; emits `Closed` on the event stream.
    async fn disconnect(&self, grace: Duration);
}
