//! Message Types
//!
//! Transport-neutral values exchanged between the transport, the
//! connection manager and the router.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest packet MQTT can frame (MAX_REMAINING_LENGTH + 5)
pub const MAX_PACKET_SIZE: usize = MAX_REMAINING_LENGTH + 5;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(try_from = "u8")]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        QoS::from_u8(v).ok_or_else(|| format!("invalid QoS {}, must be 0, 1 or 2", v))
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A message delivered by the transport.
///
/// Constructed on delivery, handed to the router, dropped after handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Concrete topic the message was published on (never a filter)
    pub topic: String,
    /// Opaque payload
    pub payload: Bytes,
    /// QoS the message was delivered with
    pub qos: QoS,
    /// Whether the broker flagged it as retained
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Transport acknowledgment for a publish.
///
/// For QoS 0 this means the packet was written to the connection; for
/// QoS 1/2 the broker confirmed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Packet identifier (0 for QoS 0)
    pub packet_id: u16,
    pub qos: QoS,
}

/// Bytes a PUBLISH for `topic` with `payload_len` payload bytes occupies on
/// the wire, fixed header included.
pub fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    1 + variable_int_len(remaining) + remaining
}

/// Calculate the number of bytes needed to encode a Variable Byte Integer
#[inline]
fn variable_int_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_packet_size() {
        // 0x30, len, 0x00 0x01, 'a'
        assert_eq!(publish_packet_size("a", 0, QoS::AtMostOnce), 5);
        // plus packet id and payload
        assert_eq!(publish_packet_size("a", 3, QoS::AtLeastOnce), 10);
    }

    #[test]
    fn test_publish_packet_size_length_boundaries() {
        // remaining length 127 fits one byte, 128 needs two
        assert_eq!(publish_packet_size("t", 124, QoS::AtMostOnce), 1 + 1 + 127);
        assert_eq!(publish_packet_size("t", 125, QoS::AtMostOnce), 1 + 2 + 128);
        assert_eq!(
            publish_packet_size("t", 16_381, QoS::AtMostOnce),
            1 + 3 + 16_384
        );
    }
}
