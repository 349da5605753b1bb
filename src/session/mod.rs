//! Broker Session
//!
//! The logical, possibly-reconnecting connection to the broker. The
//! connection manager drives the state machine; publishers only read it.
//!
//! ```text
//! Disconnected ──start──> Connecting ──CONNACK──> Connected
//!                                                   │   ▲
//!                                        link lost  │   │ CONNACK (resubscribe)
//!                                                   ▼   │
//!                                               Reconnecting
//!
//! any state ──shutdown──> Closed
//! ```
//!
//! Entering `Connected` always re-establishes the subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::BrokerConfig;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected; no reconnect in progress
    Disconnected,
    /// Initial handshake in progress
    Connecting,
    /// Connected and operational
    Connected,
    /// Link lost, transport is reconnecting
    Reconnecting,
    /// Shut down, terminal
    Closed,
}

impl SessionState {
    /// Only a connected session accepts publishes
    pub fn is_live(self) -> bool {
        self == SessionState::Connected
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Logical broker session
#[derive(Debug)]
pub struct Session {
    /// Broker address as configured
    pub address: String,
    /// Client identifier
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// PINGRESP deadline
    pub ping_timeout: Duration,
    /// Whether the transport reconnects after link loss
    pub auto_reconnect: bool,
    state: RwLock<SessionState>,
    connects: AtomicU64,
}

impl Session {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            address: config.address.clone(),
            client_id: config.client_id.clone(),
            keep_alive: config.keep_alive,
            ping_timeout: config.ping_timeout,
            auto_reconnect: config.auto_reconnect,
            state: RwLock::new(SessionState::Disconnected),
            connects: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether publishes can go out right now
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Number of successful connects, initial one included
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Move to `next`, returning the previous state.
    ///
    /// `Closed` is terminal: once closed, further transitions are ignored
    /// and `Closed` is returned.
    pub fn transition(&self, next: SessionState) -> SessionState {
        let mut state = self.state.write();
        let prev = *state;
        if prev == SessionState::Closed {
            return prev;
        }
        *state = next;
        if next == SessionState::Connected {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);

        if prev != next {
            debug!("Session '{}': {} -> {}", self.client_id, prev, next);
        }
        prev
    }

    /// State to enter after the link drops
    pub fn state_after_link_loss(&self) -> SessionState {
        if self.auto_reconnect {
            SessionState::Reconnecting
        } else {
            SessionState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(auto_reconnect: bool) -> Session {
        Session::new(&BrokerConfig {
            address: "tcp://localhost:1883".to_string(),
            client_id: "session-test".to_string(),
            auto_reconnect,
            ..Default::default()
        })
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let s = session(true);
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.is_live());
        assert_eq!(s.connect_count(), 0);
        assert_eq!(s.keep_alive, Duration::from_secs(30));
    }

    #[test]
    fn test_only_connected_is_live() {
        let s = session(true);
        for state in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Reconnecting,
        ] {
            s.transition(state);
            assert!(!s.is_live(), "{} must not be live", state);
        }
        s.transition(SessionState::Connected);
        assert!(s.is_live());
    }

    #[test]
    fn test_connect_count_tracks_reconnects() {
        let s = session(true);
        s.transition(SessionState::Connecting);
        s.transition(SessionState::Connected);
        s.transition(s.state_after_link_loss());
        assert_eq!(s.state(), SessionState::Reconnecting);
        s.transition(SessionState::Connected);
        assert_eq!(s.connect_count(), 2);
    }

    #[test]
    fn test_link_loss_without_reconnect() {
        let s = session(false);
        assert_eq!(s.state_after_link_loss(), SessionState::Disconnected);
    }

    #[test]
    fn test_closed_is_terminal() {
        let s = session(true);
        s.transition(SessionState::Connected);
        assert_eq!(s.transition(SessionState::Closed), SessionState::Connected);
        assert_eq!(s.transition(SessionState::Connected), SessionState::Closed);
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.connect_count(), 1);
    }
}
