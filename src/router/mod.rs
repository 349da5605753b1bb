//! Message Router
//!
//! Decides, per inbound message, whether and where to answer:
//!
//! 1. Messages on a result topic are dropped (loop prevention).
//! 2. The result topic is derived from the source topic.
//! 3. The response carries the next sequence number.
//! 4. The response goes out only while the session is live.

mod counter;
mod stats;

#[cfg(test)]
mod tests;

pub use counter::SequenceCounter;
pub use stats::{RouterStats, RouterStatsSnapshot};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::manager::{MessageHandler, SessionPublisher};
use crate::protocol::{Ack, Message, QoS};
use crate::topic::{ends_with_level, SEPARATOR};

/// Where responses go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultTopic {
    /// `<source topic>/<suffix>`
    PerSourceSuffix { suffix: String },
    /// Always `topic`; `suffix` still marks foreign result topics
    Fixed { topic: String, suffix: String },
}

impl ResultTopic {
    pub fn per_source(suffix: impl Into<String>) -> Self {
        ResultTopic::PerSourceSuffix {
            suffix: suffix.into(),
        }
    }

    pub fn fixed(topic: impl Into<String>, suffix: impl Into<String>) -> Self {
        ResultTopic::Fixed {
            topic: topic.into(),
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        match self {
            ResultTopic::PerSourceSuffix { suffix } | ResultTopic::Fixed { suffix, .. } => suffix,
        }
    }

    /// Whether `topic` carries responses and must not be answered
    pub fn is_result(&self, topic: &str) -> bool {
        match self {
            ResultTopic::PerSourceSuffix { suffix } => ends_with_level(topic, suffix),
            ResultTopic::Fixed {
                topic: fixed,
                suffix,
            } => topic == fixed || ends_with_level(topic, suffix),
        }
    }

    /// Result topic for a message on `source`
    pub fn derive(&self, source: &str) -> String {
        match self {
            ResultTopic::PerSourceSuffix { suffix } => {
                format!("{}{}{}", source, SEPARATOR, suffix)
            }
            ResultTopic::Fixed { topic, .. } => topic.clone(),
        }
    }

    /// `Result message #<sequence>`, followed by ` <source payload>` when
    /// every source has its own result topic.
    pub fn compose_payload(&self, sequence: u64, source: &[u8]) -> Bytes {
        let header = format!("Result message #{}", sequence);
        match self {
            ResultTopic::Fixed { .. } => Bytes::from(header),
            ResultTopic::PerSourceSuffix { .. } => {
                let mut buf = BytesMut::with_capacity(header.len() + 1 + source.len());
                buf.put_slice(header.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(source);
                buf.freeze()
            }
        }
    }
}

impl std::fmt::Display for ResultTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultTopic::PerSourceSuffix { suffix } => write!(f, "<source>/{}", suffix),
            ResultTopic::Fixed { topic, .. } => write!(f, "{}", topic),
        }
    }
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Result topic, not answered
    Ignored,
    /// Response acknowledged by the transport
    Published {
        topic: String,
        sequence: u64,
        ack: Ack,
    },
    /// Session not live; response dropped
    Skipped { topic: String, sequence: u64 },
    /// Transport failed or timed out; response dropped
    Failed {
        topic: String,
        sequence: u64,
        reason: String,
    },
}

/// Message router
pub struct Router {
    result_topic: ResultTopic,
    publisher: SessionPublisher,
    qos: QoS,
    retain: bool,
    counter: SequenceCounter,
    stats: RouterStats,
}

impl Router {
    pub fn new(result_topic: ResultTopic, publisher: SessionPublisher) -> Self {
        Self {
            result_topic,
            publisher,
            qos: QoS::AtMostOnce,
            retain: false,
            counter: SequenceCounter::new(),
            stats: RouterStats::default(),
        }
    }

    /// Outbound QoS and retain flag
    pub fn with_qos(mut self, qos: QoS, retain: bool) -> Self {
        self.qos = qos;
        self.retain = retain;
        self
    }

    pub fn with_counter(mut self, counter: SequenceCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn result_topic(&self) -> &ResultTopic {
        &self.result_topic
    }

    pub fn counter(&self) -> &SequenceCounter {
        &self.counter
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Handle one inbound message
    pub async fn route(&self, message: &Message) -> RouteOutcome {
        RouterStats::incr(&self.stats.received);
        info!(
            "RECV [{}] {}",
            message.topic,
            String::from_utf8_lossy(&message.payload)
        );

        if self.result_topic.is_result(&message.topic) {
            RouterStats::incr(&self.stats.ignored);
            debug!("Ignoring result topic '{}'", message.topic);
            return RouteOutcome::Ignored;
        }

        let topic = self.result_topic.derive(&message.topic);
        let sequence = self.counter.next();
        let payload = self.result_topic.compose_payload(sequence, &message.payload);

        if !self.publisher.is_live() {
            RouterStats::incr(&self.stats.skipped);
            warn!(
                "Not connected, dropping response #{} for '{}'",
                sequence, topic
            );
            return RouteOutcome::Skipped { topic, sequence };
        }

        debug!("Publishing response #{} to '{}'", sequence, topic);
        match self
            .publisher
            .publish(&topic, payload.clone(), self.qos, self.retain)
            .await
        {
            Ok(ack) => {
                RouterStats::incr(&self.stats.published);
                info!("SEND [{}] {}", topic, String::from_utf8_lossy(&payload));
                RouteOutcome::Published {
                    topic,
                    sequence,
                    ack,
                }
            }
            Err(e) if e.is_disconnected() => {
                RouterStats::incr(&self.stats.skipped);
                warn!(
                    "Not connected, dropping response #{} for '{}'",
                    sequence, topic
                );
                RouteOutcome::Skipped { topic, sequence }
            }
            Err(e) => {
                RouterStats::incr(&self.stats.failed);
                error!("Response #{} dropped: {}", sequence, e);
                RouteOutcome::Failed {
                    topic,
                    sequence,
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Router {
    async fn on_message(&self, message: Message) {
        self.route(&message).await;
    }
}
