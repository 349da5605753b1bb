//! Routing Configuration
//!
//! What to subscribe to and where responses go.

use serde::Deserialize;

use crate::protocol::QoS;
use crate::router::ResultTopic;

/// How the response topic is derived from the inbound topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStrategy {
    /// `<inbound topic>/<suffix>`; every source gets its own result topic
    #[default]
    #[serde(alias = "per-source-suffix")]
    PerSourceSuffix,
    /// One configured topic for every response
    #[serde(alias = "fixed-topic")]
    FixedTopic,
}

impl std::fmt::Display for ResultStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultStrategy::PerSourceSuffix => write!(f, "per-source-suffix"),
            ResultStrategy::FixedTopic => write!(f, "fixed-topic"),
        }
    }
}

/// Routing configuration (`[routing]` table)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Topic filter to subscribe to on every connect
    pub subscribe: String,

    /// QoS requested for the subscription
    pub subscribe_qos: QoS,

    /// Result topic strategy
    pub strategy: ResultStrategy,

    /// Result topic for the fixed strategy
    pub fixed_topic: Option<String>,

    /// Last topic level that marks a response (loop prevention)
    pub suffix: String,

    /// QoS for responses
    pub qos: QoS,

    /// Retain flag for responses
    pub retain: bool,
}

pub(crate) fn default_suffix() -> String {
    "result".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            subscribe: "#".to_string(),
            subscribe_qos: QoS::AtMostOnce,
            strategy: ResultStrategy::default(),
            fixed_topic: None,
            suffix: default_suffix(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

impl RoutingConfig {
    /// Resolve the strategy into the router's topic derivation.
    ///
    /// Returns `None` for the fixed strategy without a topic; validation
    /// rejects that combination.
    pub fn result_topic(&self) -> Option<ResultTopic> {
        match self.strategy {
            ResultStrategy::PerSourceSuffix => Some(ResultTopic::PerSourceSuffix {
                suffix: self.suffix.clone(),
            }),
            ResultStrategy::FixedTopic => self
                .fixed_topic
                .as_ref()
                .map(|topic| ResultTopic::Fixed {
                    topic: topic.clone(),
                    suffix: self.suffix.clone(),
                }),
        }
    }
}
