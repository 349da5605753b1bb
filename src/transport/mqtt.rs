//! MQTT Transport
//!
//! Drives a broker session with `rumqttc`. A background driver task polls
//! the event loop, turns packets into [`TransportEvent`]s and completes
//! pending publish/subscribe acknowledgments.
//!
//! Publishes are correlated with their packet identifiers by order: within
//! one link every accepted request yields exactly one `Outgoing::Publish`,
//! in the order requests entered the client channel. Two things keep that
//! true:
//!
//! - a publish above the packet limit is refused before it is queued, so
//!   rumqttc never drops one silently
//! - each link gets its own client and event loop; on link loss the old pair
//!   is discarded with everything it still holds and every waiter fails, so
//!   nothing from a dead link is ever replayed

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{EventStream, Transport, TransportEvent};
use crate::config::{BrokerAddress, BrokerConfig};
use crate::error::{ConnectionError, PublishError, SubscriptionError};
use crate::protocol::{publish_packet_size, Ack, Message, QoS};

/// Minimum window for the DISCONNECT packet to reach the wire
const DISCONNECT_FLUSH: Duration = Duration::from_millis(100);

/// Poll interval while waiting for acknowledgments to drain
const DRAIN_POLL: Duration = Duration::from_millis(10);

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_rumqttc(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

struct PendingPublish {
    topic: String,
    qos: QoS,
    tx: oneshot::Sender<Result<Ack, PublishError>>,
}

struct PendingSubscribe {
    filter: String,
    tx: oneshot::Sender<Result<(), SubscriptionError>>,
}

/// Outstanding acknowledgments
#[derive(Default)]
struct AckTracker {
    /// Handed to the client, no packet id yet
    queued: Mutex<VecDeque<PendingPublish>>,
    /// QoS 1/2 publishes on the wire, keyed by packet id
    inflight: Mutex<HashMap<u16, PendingPublish>>,
    /// At most one subscribe is outstanding at a time
    suback: Mutex<Option<PendingSubscribe>>,
}

impl AckTracker {
    fn on_outgoing_publish(&self, pkid: u16) {
        let Some(pending) = self.queued.lock().pop_front() else {
            trace!("Outgoing publish {} has no waiter", pkid);
            return;
        };

        if pending.qos == QoS::AtMostOnce {
            let _ = pending.tx.send(Ok(Ack {
                packet_id: pkid,
                qos: pending.qos,
            }));
        } else {
            self.inflight.lock().insert(pkid, pending);
        }
    }

    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    fn on_publish_complete(&self, pkid: u16) {
        if let Some(pending) = self.inflight.lock().remove(&pkid) {
            let _ = pending.tx.send(Ok(Ack {
                packet_id: pkid,
                qos: pending.qos,
            }));
        }
    }

    fn on_suback(&self, codes: &[SubscribeReasonCode]) {
        let Some(pending) = self.suback.lock().take() else {
            return;
        };

        let result = if codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(SubscriptionError::Rejected(pending.filter))
        } else {
            Ok(())
        };
        let _ = pending.tx.send(result);
    }

    /// Fail every waiter. Called when the link they were queued on is gone.
    fn fail_all(&self, reason: &str) {
        let queued = self.queued.lock().drain(..).collect::<Vec<_>>();
        let inflight = self.inflight.lock().drain().map(|(_, p)| p).collect::<Vec<_>>();
        for pending in queued.into_iter().chain(inflight) {
            let _ = pending.tx.send(Err(PublishError::Transport {
                topic: pending.topic,
                reason: reason.to_string(),
            }));
        }
        if let Some(pending) = self.suback.lock().take() {
            let _ = pending.tx.send(Err(SubscriptionError::Transport {
                filter: pending.filter,
                reason: reason.to_string(),
            }));
        }
    }

    fn is_drained(&self) -> bool {
        self.queued.lock().is_empty() && self.inflight.lock().is_empty()
    }
}

/// Result of one driver iteration
enum Step {
    Event(Result<Event, rumqttc::ConnectionError>),
    PingOverdue,
}

/// Builds the client/event loop pair for each link
#[derive(Clone)]
struct LinkFactory {
    options: MqttOptions,
    capacity: usize,
}

impl LinkFactory {
    fn build(&self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.options.clone(), self.capacity)
    }
}

/// Background task owning the current event loop
struct Driver {
    eventloop: EventLoop,
    client: Arc<Mutex<AsyncClient>>,
    links: LinkFactory,
    tracker: Arc<AckTracker>,
    closing: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    address: String,
    ping_timeout: Duration,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl Driver {
    fn emit(&self, event: TransportEvent) {
        // Receiver gone means nobody cares anymore
        let _ = self.events.send(event);
    }

    /// Swap in a fresh client and event loop.
    ///
    /// Holding the client lock keeps publishers from queueing on the old
    /// client after its waiters have been failed.
    fn replace_link(&mut self, reason: &str) {
        let mut client = self.client.lock();
        self.tracker.fail_all(reason);
        let (fresh, eventloop) = self.links.build();
        *client = fresh;
        self.eventloop = eventloop;
    }

    async fn run(mut self) {
        let mut retry_interval = self.reconnect_interval;
        let mut ping_deadline: Option<Instant> = None;

        loop {
            let step = match ping_deadline {
                Some(deadline) => tokio::select! {
                    event = self.eventloop.poll() => Step::Event(event),
                    _ = tokio::time::sleep_until(deadline) => Step::PingOverdue,
                },
                None => Step::Event(self.eventloop.poll().await),
            };

            let reason = match step {
                Step::Event(Ok(event)) => {
                    match event {
                        Event::Incoming(Packet::ConnAck(ack)) => {
                            retry_interval = self.reconnect_interval;
                            ping_deadline = None;
                            info!("Connected to {}", self.address);
                            self.emit(TransportEvent::Connected {
                                session_present: ack.session_present,
                            });
                        }
                        Event::Incoming(Packet::Publish(publish)) => {
                            self.emit(TransportEvent::Message(Message {
                                topic: publish.topic,
                                payload: publish.payload,
                                qos: from_rumqttc(publish.qos),
                                retain: publish.retain,
                            }));
                        }
                        Event::Incoming(Packet::PubAck(ack)) => {
                            self.tracker.on_publish_complete(ack.pkid);
                        }
                        Event::Incoming(Packet::PubComp(comp)) => {
                            self.tracker.on_publish_complete(comp.pkid);
                        }
                        Event::Incoming(Packet::SubAck(suback)) => {
                            self.tracker.on_suback(&suback.return_codes);
                        }
                        Event::Incoming(Packet::PingResp) => {
                            ping_deadline = None;
                        }
                        Event::Outgoing(Outgoing::Publish(pkid)) => {
                            self.tracker.on_outgoing_publish(pkid);
                        }
                        Event::Outgoing(Outgoing::PingReq) => {
                            ping_deadline = Some(Instant::now() + self.ping_timeout);
                        }
                        Event::Outgoing(Outgoing::Disconnect)
                            if self.closing.load(Ordering::SeqCst) =>
                        {
                            debug!("DISCONNECT sent to {}", self.address);
                            break;
                        }
                        other => trace!("{:?}", other),
                    }
                    continue;
                }
                Step::Event(Err(e)) => e.to_string(),
                Step::PingOverdue => format!("no PINGRESP within {:?}", self.ping_timeout),
            };

            ping_deadline = None;
            if self.closing.load(Ordering::SeqCst) {
                break;
            }

            warn!("Link to {} lost: {}", self.address, reason);
            self.emit(TransportEvent::Disconnected {
                reason: reason.clone(),
            });

            if !self.auto_reconnect {
                self.tracker.fail_all(&reason);
                self.emit(TransportEvent::Closed);
                break;
            }
            self.replace_link(&reason);

            debug!(
                "Reconnecting to {} in {:?}",
                self.address, retry_interval
            );

            // Exponential backoff
            tokio::time::sleep(retry_interval).await;
            retry_interval = std::cmp::min(retry_interval * 2, self.max_reconnect_interval);
        }
    }
}

/// Broker session over `rumqttc`
pub struct MqttTransport {
    address: BrokerAddress,
    links: LinkFactory,
    /// Client of the current link; replaced by the driver on link loss
    client: Arc<Mutex<AsyncClient>>,
    eventloop: Mutex<Option<EventLoop>>,
    tracker: Arc<AckTracker>,
    closing: Arc<AtomicBool>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    subscribe_lock: tokio::sync::Mutex<()>,
    max_packet_size: usize,
    ping_timeout: Duration,
    auto_reconnect: bool,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

impl MqttTransport {
    pub fn new(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let address = config
            .parse_address()
            .map_err(ConnectionError::InvalidConfig)?;
        if !config.keep_alive.is_zero() && config.keep_alive < Duration::from_secs(1) {
            return Err(ConnectionError::InvalidConfig(format!(
                "keep-alive of {:?} is below one second",
                config.keep_alive
            )));
        }

        let mut options = MqttOptions::new(&config.client_id, &address.host, address.port);
        options
            .set_keep_alive(config.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(config.max_packet_size, config.max_packet_size);

        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        if address.protocol.uses_tls() {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let links = LinkFactory {
            options,
            capacity: config.request_capacity,
        };
        let (client, eventloop) = links.build();

        Ok(Self {
            address,
            links,
            client: Arc::new(Mutex::new(client)),
            eventloop: Mutex::new(Some(eventloop)),
            tracker: Arc::new(AckTracker::default()),
            closing: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(None),
            driver: Mutex::new(None),
            subscribe_lock: tokio::sync::Mutex::new(()),
            max_packet_size: config.max_packet_size,
            ping_timeout: config.ping_timeout,
            auto_reconnect: config.auto_reconnect,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
        })
    }

    /// Resolved broker endpoint
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<EventStream, ConnectionError> {
        let eventloop = self
            .eventloop
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            eventloop,
            client: self.client.clone(),
            links: self.links.clone(),
            tracker: self.tracker.clone(),
            closing: self.closing.clone(),
            events: tx.clone(),
            address: self.address.to_string(),
            ping_timeout: self.ping_timeout,
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_interval: self.max_reconnect_interval,
        };
        *self.events.lock() = Some(tx);

        debug!("Connecting to {}", self.address);
        *self.driver.lock() = Some(tokio::spawn(driver.run()));
        Ok(rx)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), SubscriptionError> {
        let _guard = self.subscribe_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let client = self.client.lock();
            *self.tracker.suback.lock() = Some(PendingSubscribe {
                filter: filter.to_string(),
                tx,
            });

            if let Err(e) = client.try_subscribe(filter, to_rumqttc(qos)) {
                self.tracker.suback.lock().take();
                return Err(SubscriptionError::Transport {
                    filter: filter.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(SubscriptionError::Transport {
                filter: filter.to_string(),
                reason: "transport stopped".to_string(),
            })
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<Ack, PublishError> {
        if self.closing.load(Ordering::SeqCst) {
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

        let (tx, rx) = oneshot::channel();
        {
            // Queue entry and channel request are ordered by the client lock
            let client = self.client.lock();
            self.tracker.queued.lock().push_back(PendingPublish {
                topic: topic.to_string(),
                qos,
                tx,
            });

            if let Err(e) = client.try_publish(topic, to_rumqttc(qos), retain, payload.to_vec()) {
                self.tracker.queued.lock().pop_back();
                return Err(PublishError::Transport {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(PublishError::Transport {
                topic: topic.to_string(),
                reason: "transport stopped".to_string(),
            })
        })
    }

    async fn disconnect(&self, grace: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline = Instant::now() + grace;
        let drained = tokio::time::timeout_at(deadline, async {
            while !self.tracker.is_drained() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            debug!(
                "Disconnecting from {} with acknowledgments outstanding",
                self.address
            );
        }

        let client = self.client.lock().clone();
        let flush_deadline = deadline.max(Instant::now() + DISCONNECT_FLUSH);
        match tokio::time::timeout_at(flush_deadline, client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("DISCONNECT to {} not queued: {}", self.address, e),
            Err(_) => debug!("DISCONNECT to {} not queued in time", self.address),
        }

        let driver = self.driver.lock().take();
        if let Some(mut handle) = driver {
            if tokio::time::timeout_at(flush_deadline, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        self.tracker.fail_all("transport closed");
        if let Some(events) = self.events.lock().take() {
            let _ = events.send(TransportEvent::Closed);
        }
    }
}
