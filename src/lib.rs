//! VibeMQ Relay - MQTT request/response relay
//!
//! Keeps one client session open against an MQTT broker, listens on a topic
//! filter and answers every message on a derived result topic. Messages on
//! result topics are never answered, so the relay cannot feed on itself.

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod router;
pub mod session;
pub mod topic;
pub mod transport;

pub use config::Config;
pub use error::{ConnectionError, PublishError, SubscriptionError};
pub use manager::{ConnectionManager, MessageHandler, SessionPublisher, Subscription};
pub use protocol::{Ack, Message, QoS};
pub use router::{ResultTopic, RouteOutcome, Router, RouterStats, SequenceCounter};
pub use session::{Session, SessionState};
pub use transport::{MemoryTransport, MqttTransport, Transport, TransportEvent};
