//! Topic names and filters
//!
//! The relay never routes on filters itself; validation guards the
//! configuration, and matching backs the in-process transport.

pub mod validation;

pub use validation::{
    ends_with_level, shared_filter_target, topic_matches_filter, validate_topic_filter, validate_topic_name,
    TopicLevel,
};

/// Level separator
pub const SEPARATOR: char = '/';
