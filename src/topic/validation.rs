//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are not matched by a leading wildcard

/// Validate a topic name (used in PUBLISH and wills)
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

    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE and bridge registration)
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

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name
///
/// - `/` is the level separator, empty levels are significant
/// - `+` matches exactly one level
/// - `#` matches the parent level and any number of child levels
/// - `$` topics are not matched by a filter starting with `+` or `#`
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topic_names() {
        assert!(validate_topic_name("sport/tennis").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("a//b").is_ok());
        assert!(validate_topic_name("$SYS/broker").is_ok());
    }

    #[test]
    fn test_invalid_topic_names() {
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("sport/+").is_err());
        assert!(validate_topic_name("sport/#").is_err());
        assert!(validate_topic_name("a\0b").is_err());
    }

    #[test]
    fn test_valid_topic_filters() {
        for filter in ["#", "+", "sport/#", "sport/+/player1", "+/+", "/+", "$SYS/#"] {
            assert!(validate_topic_filter(filter).is_ok(), "{}", filter);
        }
    }

    #[test]
    fn test_invalid_topic_filters() {
        for filter in ["", "sport#", "sport/#/ranking", "sport+", "sport/+tennis", "#/"] {
            assert!(validate_topic_filter(filter).is_err(), "{}", filter);
        }
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("sport/tennis/score", "sport/+/score"));
        assert!(!topic_matches_filter("sport/tennis/score", "sport/+"));
        assert!(topic_matches_filter("sport/tennis", "sport/+"));
        assert!(!topic_matches_filter("sport", "sport/+"));
        assert!(topic_matches_filter("sport/", "sport/+"));
        assert!(topic_matches_filter("anything/at/all", "#"));
        assert!(topic_matches_filter("sport", "sport/#"));
        assert!(topic_matches_filter("sport/tennis/player1", "sport/#"));
        assert!(!topic_matches_filter("sports", "sport/#"));
        assert!(topic_matches_filter("/finance", "+/+"));
        assert!(topic_matches_filter("/finance", "/+"));
        assert!(!topic_matches_filter("/finance", "+"));
    }

    #[test]
    fn test_topic_matches_case_and_empty_levels() {
        assert!(!topic_matches_filter("Sport/tennis", "sport/tennis"));
        assert!(!topic_matches_filter("a//b", "a/b"));
        assert!(topic_matches_filter("a//b", "a/+/b"));
        assert!(topic_matches_filter("a//b", "a//b"));
    }

    #[test]
    fn test_system_topic_matching() {
        assert!(!topic_matches_filter("$SYS/monitor", "#"));
        assert!(!topic_matches_filter("$SYS/monitor", "+/monitor"));
        assert!(topic_matches_filter("$SYS/monitor", "$SYS/#"));
        assert!(topic_matches_filter("$SYS/monitor", "$SYS/+"));
        assert!(topic_matches_filter("a/$SYS", "a/+"));
    }
}
