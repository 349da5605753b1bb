//! Relay error types
//!
//! Only [`ConnectionError`] is fatal. Everything else is contained by the
//! component that hit it and surfaced through logging.

use std::time::Duration;

use thiserror::Error;

/// The initial session could not be established
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Network failure or broker refusal during the handshake
    #[error("initial connect to {address} failed: {reason}")]
    Handshake { address: String, reason: String },
    /// No CONNACK within the connect timeout
    #[error("initial connect to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    /// Transport event stream ended before the handshake finished
    #[error("transport closed before the session was established")]
    Closed,
    /// Broker address or options the transport cannot use
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    /// start() called twice on the same manager
    #[error("session already started")]
    AlreadyStarted,
}

/// A subscribe call failed on an otherwise healthy connection
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Broker answered SUBACK with a failure code
    #[error("broker rejected subscription to '{0}'")]
    Rejected(String),
    /// Request could not be handed to the transport
    #[error("subscribe to '{filter}' failed: {reason}")]
    Transport { filter: String, reason: String },
    /// No SUBACK within the ack timeout
    #[error("subscribe to '{0}' timed out")]
    Timeout(String),
}

/// A publish was not delivered. Never fatal; the message is dropped.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Session not live; returned immediately without touching the transport
    #[error("session is not connected")]
    Disconnected,
    /// The transport reported a send failure
    #[error("publish to '{topic}' failed: {reason}")]
    Transport { topic: String, reason: String },
    /// Packet would exceed the configured maximum packet size; nothing was sent
    #[error("publish to '{topic}' is {size} bytes, above the {max} byte packet limit")]
    TooLarge {
        topic: String,
        size: usize,
        max: usize,
    },
    /// No acknowledgment within the ack timeout
    #[error("publish to '{topic}' not acknowledged within {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
}

impl PublishError {
    /// Informational classification: the message was dropped because the
    /// session was down, not because anything went wrong on the wire.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, PublishError::Disconnected)
    }
}
