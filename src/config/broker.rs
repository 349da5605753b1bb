//! Broker Connection Configuration
//!
//! Where to connect, how to identify, and how the session is kept alive.

use std::time::Duration;

use serde::Deserialize;

/// Broker connection protocol, taken from the address scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerProtocol {
    /// Plain MQTT over TCP (`tcp://`, `mqtt://` or no scheme)
    #[default]
    Mqtt,
    /// MQTT over TLS (`ssl://`, `tls://`, `mqtts://`)
    Mqtts,
}

impl std::fmt::Display for BrokerProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerProtocol::Mqtt => write!(f, "mqtt"),
            BrokerProtocol::Mqtts => write!(f, "mqtts"),
        }
    }
}

impl BrokerProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            BrokerProtocol::Mqtt => 1883,
            BrokerProtocol::Mqtts => 8883,
        }
    }

    /// Check if this protocol uses TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, BrokerProtocol::Mqtts)
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => Some(BrokerProtocol::Mqtt),
            "ssl" | "tls" | "mqtts" => Some(BrokerProtocol::Mqtts),
            _ => None,
        }
    }
}

/// Resolved broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub protocol: BrokerProtocol,
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Broker session configuration (`[broker]` table)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address, e.g. `tcp://broker.hivemq.com:1883` or `localhost`
    pub address: String,

    /// Client ID; must be unique among sessions on the same broker
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// How long to wait for a PINGRESP before the session is treated as stale
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// How long the initial handshake may take
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a publish or subscribe waits for its acknowledgment
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Reconnect automatically after the session drops
    pub auto_reconnect: bool,

    /// First reconnect delay
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Ceiling for the exponential reconnect backoff
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Time allowed for in-flight acknowledgments during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Transport request queue capacity
    pub request_capacity: usize,

    /// Largest MQTT packet sent or accepted, in bytes
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(250),
            request_capacity: 100,
            max_packet_size: 1024 * 1024,
        }
    }
}

impl BrokerConfig {
    /// Split the address into protocol, host and port.
    ///
    /// The scheme is optional; the port defaults per protocol.
    pub fn parse_address(&self) -> Result<BrokerAddress, String> {
        let address = self.address.trim();
        let (protocol, rest) = match address.split_once("://") {
            Some((scheme, rest)) => {
                let protocol = BrokerProtocol::from_scheme(scheme)
                    .ok_or_else(|| format!("unsupported broker scheme '{}'", scheme))?;
                (protocol, rest)
            }
            None => (BrokerProtocol::Mqtt, address),
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| format!("invalid broker port '{}'", port_str))?;
                (host, port)
            }
            None => (rest, protocol.default_port()),
        };

        if host.is_empty() {
            return Err(format!("broker address '{}' has no host", self.address));
        }

        Ok(BrokerAddress {
            protocol,
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_address(address: &str) -> BrokerConfig {
        BrokerConfig {
            address: address.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_address_with_scheme_and_port() {
        let addr = with_address("tcp://broker.hivemq.com:1883")
            .parse_address()
            .unwrap();
        assert_eq!(addr.protocol, BrokerProtocol::Mqtt);
        assert_eq!(addr.host, "broker.hivemq.com");
        assert_eq!(addr.port, 1883);
    }

    #[test]
    fn test_parse_address_without_port() {
        let addr = with_address("ssl://broker.example.com")
            .parse_address()
            .unwrap();
        assert_eq!(addr.protocol, BrokerProtocol::Mqtts);
        assert_eq!(addr.port, 8883); // Default for mqtts
    }

    #[test]
    fn test_parse_bare_host() {
        let addr = with_address("localhost").parse_address().unwrap();
        assert_eq!(addr.protocol, BrokerProtocol::Mqtt);
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 1883);
        assert_eq!(addr.to_string(), "mqtt://localhost:1883");
    }

    #[test]
    fn test_parse_address_errors() {
        assert!(with_address("ws://broker:80").parse_address().is_err());
        assert!(with_address("tcp://broker:notaport").parse_address().is_err());
        assert!(with_address("tcp://:1883").parse_address().is_err());
        assert!(with_address("").parse_address().is_err());
    }

    #[test]
    fn test_protocol_defaults() {
        assert_eq!(BrokerProtocol::Mqtt.default_port(), 1883);
        assert_eq!(BrokerProtocol::Mqtts.default_port(), 8883);
        assert!(BrokerProtocol::Mqtts.uses_tls());
        assert!(!BrokerProtocol::Mqtt.uses_tls());
    }
}
