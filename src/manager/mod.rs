//! Connection Manager
//!
//! Owns the broker session. It performs the initial handshake, re-establishes
//! the subscription every time the session (re)connects, hands inbound
//! messages to a [`MessageHandler`], and closes the session on shutdown.
//!
//! Transport events are consumed by a single task in arrival order, so a
//! reconnect's resubscribe is always issued before any message that arrived
//! after it is dispatched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ConnectionError, PublishError, SubscriptionError};
use crate::protocol::{publish_packet_size, Ack, Message, QoS};
use crate::session::{Session, SessionState};
use crate::transport::{EventStream, Transport, TransportEvent};


/// Receives every inbound message.
///
/// Each message is handled in its own task; implementations must tolerate
/// concurrent calls.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: Message);
}

/// The subscription kept alive across reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// Publish handle bound to the session's liveness
#[derive(Clone)]
pub struct SessionPublisher {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    ack_timeout: Duration,
    max_packet_size: usize,
}

impl SessionPublisher {
    /// Whether a publish would be attempted right now
    pub fn is_live(&self) -> bool {
        self.session.is_live()
    }

    /// Publish and wait for the transport acknowledgment.
    ///
    /// Fails immediately with [`PublishError::Disconnected`] when the session
    /// is not live; nothing is buffered for later. A packet above the
    /// configured limit fails with [`PublishError::TooLarge`] and never
    /// reaches the transport.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, PublishError> {
        if !self.session.is_live() {
            return Err(PublishError::Disconnected);
        }

        let size = publish_packet_size(topic, payload.len(), qos);
        if size > self.max_packet_size {
            return Err(PublishError::TooLarge {
                topic: topic.to_string(),
                size,
                max: self.max_packet_size,
            });
        }

        match tokio::time::timeout(
            self.ack_timeout,
            self.transport.publish(topic, payload, qos, retain),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout {
                topic: topic.to_string(),
                timeout: self.ack_timeout,
            }),
        }
    }
}

/// State shared between the manager and its event task
#[derive(Clone)]
struct Shared {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    ack_timeout: Duration,
    max_packet_size: usize,
}

impl Shared {
    /// Mark the session live and (re)establish the subscription.
    ///
    /// A failed subscribe is logged and left for the next reconnect.
    async fn on_connected(&self) {
        if self.session.transition(SessionState::Connected) == SessionState::Closed {
            return;
        }

        let Subscription { filter, qos } = &self.subscription;
        match tokio::time::timeout(self.ack_timeout, self.transport.subscribe(filter, *qos)).await
        {
            Ok(Ok(())) => info!("Subscribed to '{}' (QoS {})", filter, qos),
            Ok(Err(e)) => error!("Subscription failed: {}", e),
            Err(_) => error!(
                "Subscription failed: {}",
                SubscriptionError::Timeout(filter.clone())
            ),
        }
    }

    async fn run_events(self, mut events: EventStream, handler: Arc<dyn MessageHandler>) {
        while let Some(event) = events.recv().await {
            if self.session.state() == SessionState::Closed {
                break;
            }

            match event {
                TransportEvent::Connected { session_present } => {
                    info!(
                        "Reconnected to {} (session present: {})",
                        self.session.address, session_present
                    );
                    self.on_connected().await;
                }
                TransportEvent::Disconnected { reason } => {
                    let next = self.session.state_after_link_loss();
                    self.session.transition(next);
                    warn!("Connection to {} lost: {} ({})", self.session.address, reason, next);
                }
                TransportEvent::Message(message) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.on_message(message).await;
                    });
                }
                TransportEvent::Closed => {
                    if self.session.auto_reconnect {
                        debug!("Transport for '{}' closed", self.session.client_id);
                    } else {
                        warn!(
                            "Session to {} is down and auto-reconnect is disabled",
                            self.session.address
                        );
                    }
                    break;
                }
            }
        }
    }
}

/// Connection manager
pub struct ConnectionManager {
    shared: Shared,
    connect_timeout: Duration,
    started: AtomicBool,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let broker = &config.broker;
        Self {
            shared: Shared {
                session: Arc::new(Session::new(broker)),
                transport,
                subscription: Subscription {
                    filter: config.routing.subscribe.clone(),
                    qos: config.routing.subscribe_qos,
                },
                ack_timeout: broker.ack_timeout,
                max_packet_size: broker.max_packet_size,
            },
            connect_timeout: broker.connect_timeout,
            started: AtomicBool::new(false),
            event_task: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Arc<Session> {
        self.shared.session.clone()
    }

    pub fn subscription(&self) -> &Subscription {
        &self.shared.subscription
    }

    /// Publish handle for the router
    pub fn publisher(&self) -> SessionPublisher {
        SessionPublisher {
            session: self.shared.session.clone(),
            transport: self.shared.transport.clone(),
            ack_timeout: self.shared.ack_timeout,
            max_packet_size: self.shared.max_packet_size,
        }
    }

    /// Establish the session, subscribe and start dispatching to `handler`.
    ///
    /// Only the initial connect can fail; later link loss is handled in the
    /// background by the transport's reconnect.
    pub async fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Session>, ConnectionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyStarted);
        }

        let session = &self.shared.session;
        session.transition(SessionState::Connecting);
        info!(
            "Connecting to {} as '{}'",
            session.address, session.client_id
        );

        let mut events = match self.shared.transport.connect().await {
            Ok(events) => events,
            Err(e) => {
                session.transition(SessionState::Disconnected);
                return Err(e);
            }
        };

        if let Err(e) = self.await_handshake(&mut events).await {
            self.shared.transport.disconnect(Duration::ZERO).await;
            session.transition(SessionState::Disconnected);
            return Err(e);
        }

        self.shared.on_connected().await;

        let task = tokio::spawn(self.shared.clone().run_events(events, handler));
        *self.event_task.lock() = Some(task);

        Ok(session.clone())
    }

    async fn await_handshake(&self, events: &mut EventStream) -> Result<(), ConnectionError> {
        let address = &self.shared.session.address;
        let handshake = async {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Connected { .. } => return Ok(()),
                    TransportEvent::Disconnected { reason } => {
                        return Err(ConnectionError::Handshake {
                            address: address.clone(),
                            reason,
                        })
                    }
                    TransportEvent::Closed => return Err(ConnectionError::Closed),
                    // Nothing is subscribed yet
                    TransportEvent::Message(_) => {}
                }
            }
            Err(ConnectionError::Closed)
        };

        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout {
                address: address.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Publish through the session
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, PublishError> {
        self.publisher().publish(topic, payload, qos, retain).await
    }

    /// Close the session, allowing `grace` for in-flight acknowledgments.
    ///
    /// Calling it again, or on a session that never started, only closes
    /// what is still open.
    pub async fn shutdown(&self, grace: Duration) {
        let session = &self.shared.session;
        if session.transition(SessionState::Closed) == SessionState::Closed {
            return;
        }

        info!("Closing session '{}'", session.client_id);
        self.shared.transport.disconnect(grace).await;

        let task = self.event_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        info!("Disconnected cleanly");
    }
}
