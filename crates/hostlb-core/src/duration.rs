//! Humanized duration strings ("500ms", "30s", "5m", "12h").

use std::time::Duration;

use crate::error::ConfigurationError;

/// Parse a duration string. A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// `None` when the value does not fit in a `u64` of seconds.
fn scaled(count: &str, unit_secs: u64) -> Option<Duration> {
    count
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(unit_secs))
        .map(Duration::from_secs)
}

/// Parse a config value, naming the offending key on failure.
pub fn config_duration(key: &'static str, value: &str) -> Result<Duration, ConfigurationError> {
    parse_duration(value).ok_or_else(|| ConfigurationError::InvalidDuration {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("12h"), Some(Duration::from_secs(12 * 3600)));
    }

    #[test]
    fn plain_number_is_seconds() {
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 7 "), Some(Duration::from_secs(7)));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("-3s"), None);
        assert_eq!(parse_duration("9999999999999999h"), None);
        assert_eq!(parse_duration("999999999999999999m"), None);
        assert!(matches!(
            config_duration("execution.poll_interval", "fast"),
            Err(ConfigurationError::InvalidDuration { key: "execution.poll_interval", .. })
        ));
    }
}
