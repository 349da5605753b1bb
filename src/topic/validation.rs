//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ don't match filters starting with a wildcard

use super::SEPARATOR;

const MAX_TOPIC_LEN: usize = 65535;

/// Represents a level in a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicLevel<'a> {
    /// Normal topic level
    Normal(&'a str),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

impl<'a> TopicLevel<'a> {
    fn parse(level: &'a str) -> Self {
        match level {
            "+" => TopicLevel::SingleWildcard,
            "#" => TopicLevel::MultiWildcard,
            s => TopicLevel::Normal(s),
        }
    }
}

fn check_common(s: &str, what: &'static str) -> Result<(), String> {
    if s.is_empty() {
        return Err(format!("{} cannot be empty", what));
    }
    if s.len() > MAX_TOPIC_LEN {
        return Err(format!("{} exceeds maximum length", what));
    }
    if s.contains('\0') {
        return Err(format!("{} cannot contain null character", what));
    }
    Ok(())
}

/// Validate a concrete topic name (something we publish to)
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    check_common(topic, "topic name")?;
    if topic.contains(['+', '#']) {
        return Err(format!("topic name '{}' cannot contain wildcards", topic));
    }
    Ok(())
}

/// Validate a topic filter (something we subscribe to)
///
/// Shared subscriptions (`$share/{group}/{filter}`) are accepted; the
/// group must be non-empty and wildcard-free.
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    check_common(filter, "topic filter")?;

    let actual = match filter.strip_prefix("$share/") {
        Some(rest) => {
            let (group, actual) = rest
                .split_once(SEPARATOR)
                .ok_or_else(|| format!("invalid shared subscription '{}'", filter))?;
            if group.is_empty() || group.contains(['+', '#']) {
                return Err(format!("invalid shared subscription group '{}'", group));
            }
            if actual.is_empty() {
                return Err("shared subscription filter cannot be empty".to_string());
            }
            actual
        }
        None => filter,
    };

    let levels: Vec<&str> = actual.split(SEPARATOR).collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!(
                "multi-level wildcard must be the entire last level in '{}'",
                filter
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!(
                "single-level wildcard must occupy an entire level in '{}'",
                filter
            ));
        }
    }

    Ok(())
}

/// The filter a subscription matches against, without a `$share/{group}/`
/// prefix
pub fn shared_filter_target(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once(SEPARATOR))
        .map_or(filter, |(_, actual)| actual)
}

/// Check if a topic filter matches a concrete topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split(SEPARATOR);
    for filter_level in filter.split(SEPARATOR).map(TopicLevel::parse) {
        match filter_level {
            // Matches the parent level too ("a/#" matches "a")
            TopicLevel::MultiWildcard => return true,
            TopicLevel::SingleWildcard => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            TopicLevel::Normal(expected) => {
                if topic_levels.next() != Some(expected) {
                    return false;
                }
            }
        }
    }

    topic_levels.next().is_none()
}

/// True when `topic` has at least two levels and its last level is `level`.
///
/// `sensors/temp/result` ends with `result`; a bare `result` does not.
pub fn ends_with_level(topic: &str, level: &str) -> bool {
    match topic.rsplit_once(SEPARATOR) {
        Some((_, last)) => last == level,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("nn/result").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test4472/#").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("sensors/+/temp").is_ok());
        assert!(validate_topic_filter("$share/relays/sensors/#").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("$share//sensors").is_err());
        assert!(validate_topic_filter("$share/group").is_err());
    }

    #[test_case("test", "test", true)]
    #[test_case("test/topic", "test", false)]
    #[test_case("test", "test/topic", false)]
    #[test_case("test/topic", "test/+", true)]
    #[test_case("a/b/c", "+/b/+", true)]
    #[test_case("test/topic/extra", "test/+", false)]
    #[test_case("test", "test/#", true)]
    #[test_case("test4472/x/y", "test4472/#", true)]
    #[test_case("other/topic", "test/#", false)]
    #[test_case("$SYS/uptime", "#", false)]
    #[test_case("$SYS/uptime", "$SYS/#", true)]
    fn test_topic_matches(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test_case("$share/relays/sensors/+", "sensors/+")]
    #[test_case("$share/g/#", "#")]
    #[test_case("sensors/#", "sensors/#")]
    #[test_case("$share/group", "$share/group")]
    fn test_shared_filter_target(filter: &str, expected: &str) {
        assert_eq!(shared_filter_target(filter), expected);
    }

    #[test_case("sensors/temp/result", "result", true)]
    #[test_case("sensors/temp", "result", false)]
    #[test_case("result", "result", false)]
    #[test_case("sensors/temp/results", "result", false)]
    #[test_case("sensors/result/temp", "result", false)]
    #[test_case("/result", "result", true)]
    fn test_ends_with_level(topic: &str, level: &str, expected: bool) {
        assert_eq!(ends_with_level(topic, level), expected);
    }
}
