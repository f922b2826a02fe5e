//! Topic matching and outbound topic derivation
//!
//! Bindings subscribe with a topic filter on their source brokers and
//! publish to a topic derived from their destination pattern:
//!
//! - `#` publishes to the inbound topic unchanged
//! - a pattern with `+` levels gets each `+` replaced by the inbound
//!   segment matched at that wildcard
//! - anything else is a literal topic

pub mod validation;

pub use validation::{
    capture_wildcards, topic_matches_filter, validate_destination_pattern,
    validate_topic_filter, validate_topic_name, TopicLevel,
};

/// Derive the outbound topic for one delivery.
///
/// `captures` are the segments the source filter's `+` wildcards matched
/// (see [`capture_wildcards`]). The n-th `+` of `pattern` takes the n-th
/// capture; once captures run out, the inbound topic level at the same
/// index as the `+` is used instead. Returns `None` when neither exists.
pub fn derive_topic(pattern: &str, inbound: &str, captures: &[&str]) -> Option<String> {
    if pattern == "#" {
        return Some(inbound.to_string());
    }
    if !pattern.contains('+') {
        return Some(pattern.to_string());
    }

    let inbound_levels: Vec<&str> = inbound.split('/').collect();
    let mut next_capture = captures.iter();
    let mut out = Vec::with_capacity(inbound_levels.len());

    for (index, level) in pattern.split('/').enumerate() {
        if level == "+" {
            let segment = match next_capture.next() {
                Some(segment) => *segment,
                None => *inbound_levels.get(index)?,
            };
            out.push(segment);
        } else {
            out.push(level);
        }
    }

    Some(out.join("/"))
}
