//! Topic name and filter validation
//!
//! Rules from the MQTT topic-names-and-filters sections, shared by all three
//! protocol levels:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy the final level entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Empty levels are valid ("a//c" has three levels)
//! - Topics starting with $ are excluded from root-level wildcard matches
//! - Shared subscriptions use the $share/{group}/{filter} form

use std::fmt;

/// Default upper bound on topic bytes (MQTT string limit)
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Validation failure for a topic name or filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterError {
    Empty,
    TooLong,
    /// Embedded NUL or other control character
    ControlCharacter,
    /// Wildcard in a concrete topic name
    WildcardInTopicName,
    /// '#' not alone in the final level
    MultiWildcardNotLast,
    /// '+' not occupying an entire level
    SingleWildcardNotAlone,
    /// Malformed $share/{group}/{filter} form
    InvalidShareGroup,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::Empty => write!(f, "topic cannot be empty"),
            FilterError::TooLong => write!(f, "topic exceeds maximum length"),
            FilterError::ControlCharacter => write!(f, "topic contains a control character"),
            FilterError::WildcardInTopicName => write!(f, "topic name cannot contain wildcards"),
            FilterError::MultiWildcardNotLast => {
                write!(f, "multi-level wildcard must be the entire final level")
            }
            FilterError::SingleWildcardNotAlone => {
                write!(f, "single-level wildcard must occupy an entire level")
            }
            FilterError::InvalidShareGroup => write!(f, "invalid shared subscription"),
        }
    }
}

impl std::error::Error for FilterError {}

fn has_control_characters(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// True if the filter contains any wildcard level
pub fn is_wildcard(filter: &str) -> bool {
    filter.split('/').any(|level| level == "+" || level == "#")
}

/// Split a shared subscription filter into (group, filter)
///
/// Returns `None` when the input is not of the $share/{group}/{filter} form.
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let slash = rest.find('/')?;
    let (group, actual) = (&rest[..slash], &rest[slash + 1..]);
    if group.is_empty() || actual.is_empty() {
        return None;
    }
    Some((group, actual))
}

/// Validate a concrete topic name (PUBLISH, retained store keys)
pub fn validate_topic_name(topic: &str) -> Result<(), FilterError> {
    validate_topic_name_bounded(topic, MAX_TOPIC_LENGTH)
}

pub fn validate_topic_name_bounded(topic: &str, max_length: usize) -> Result<(), FilterError> {
    if topic.is_empty() {
        return Err(FilterError::Empty);
    }
    if topic.len() > max_length {
        return Err(FilterError::TooLong);
    }
    if has_control_characters(topic) {
        return Err(FilterError::ControlCharacter);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(FilterError::WildcardInTopicName);
    }
    Ok(())
}

/// Validate a topic filter (SUBSCRIBE/UNSUBSCRIBE), shared subscriptions
/// included
pub fn validate_topic_filter(filter: &str) -> Result<(), FilterError> {
    validate_topic_filter_bounded(filter, MAX_TOPIC_LENGTH)
}

pub fn validate_topic_filter_bounded(filter: &str, max_length: usize) -> Result<(), FilterError> {
    if filter.is_empty() {
        return Err(FilterError::Empty);
    }
    if filter.len() > max_length {
        return Err(FilterError::TooLong);
    }
    if has_control_characters(filter) {
        return Err(FilterError::ControlCharacter);
    }

    let actual = if filter.starts_with("$share/") {
        let (group, actual) =
            parse_shared_subscription(filter).ok_or(FilterError::InvalidShareGroup)?;
        if group.contains('+') || group.contains('#') {
            return Err(FilterError::InvalidShareGroup);
        }
        actual
    } else {
        filter
    };

    let mut levels = actual.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" || levels.peek().is_some() {
                return Err(FilterError::MultiWildcardNotLast);
            }
        }
        if level.contains('+') && level != "+" {
            return Err(FilterError::SingleWildcardNotAlone);
        }
    }

    Ok(())
}

/// Check whether a concrete topic matches a filter
///
/// Total and O(|topic| + |filter|): one pass over both level sequences.
/// '+' matches exactly one level (including an empty one), '#' matches the
/// remainder including zero levels, and $-topics never match filters whose
/// first level is a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            // "a/#" matches "a": '#' also matches the parent level itself
            (None, None) => return true,
            (Some(_), _) | (None, Some(_)) => return false,
        }
        // A trailing lone '#' after the topic is exhausted still matches
        if topic_levels.clone().next().is_none() && filter_levels.peek() == Some(&"#") {
            return true;
        }
    }
}
