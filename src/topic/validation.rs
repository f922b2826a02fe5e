//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are system topics and have special matching rules

use smallvec::SmallVec;

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

/// Parse topic into levels
pub fn parse_levels(topic: &str) -> impl Iterator<Item = TopicLevel<'_>> {
    topic.split('/').map(|level| match level {
        "+" => TopicLevel::SingleWildcard,
        "#" => TopicLevel::MultiWildcard,
        s => TopicLevel::Normal(s),
    })
}

/// Validate a topic name (the concrete topic of a PUBLISH)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used for SUBSCRIBE/UNSUBSCRIBE)
///
/// Topic filters:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Multi-level wildcard (#) must be the only character of the last level
/// - Single-level wildcard (+) must occupy an entire level
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Validate a destination topic pattern.
///
/// Destination patterns are either exactly `#` (keep the inbound topic),
/// a filter whose wildcards are all `+` (substituted per message), or a
/// literal topic name.
pub fn validate_destination_pattern(pattern: &str) -> Result<(), &'static str> {
    if pattern == "#" {
        return Ok(());
    }
    validate_topic_filter(pattern)?;
    if pattern.contains('#') {
        return Err("destination pattern may only use '#' on its own");
    }
    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator
/// - + matches exactly one level
/// - # matches zero or more levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    capture_wildcards(topic, filter).is_some()
}

/// Segments of `topic` matched by the `+` wildcards of `filter`, in order.
///
/// Returns `None` when the topic does not match the filter at all.
pub fn capture_wildcards<'t>(topic: &'t str, filter: &str) -> Option<SmallVec<[&'t str; 4]>> {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return None;
    }

    let mut captures = SmallVec::new();
    let mut topic_levels = topic.split('/');

    for filter_level in parse_levels(filter) {
        match filter_level {
            TopicLevel::MultiWildcard => return Some(captures),
            TopicLevel::SingleWildcard => captures.push(topic_levels.next()?),
            TopicLevel::Normal(expected) => {
                if topic_levels.next()? != expected {
                    return None;
                }
            }
        }
    }

    // Both must be exhausted for a match
    match topic_levels.next() {
        Some(_) => None,
        None => Some(captures),
    }
}
