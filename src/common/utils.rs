//! Utility functions for ringroute

use std::time::Duration;

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let scaled = |factor: u64| {
        num.checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))
    };

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => scaled(60)?,
        "h" => scaled(3600)?,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reject empty or whitespace-only identifiers.
pub fn validate_id(kind: &str, id: &str) -> crate::Result<()> {
    if id.trim().is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} id must not be empty", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        let huge = format!("{}h", u64::MAX / 60);
        assert!(matches!(
            parse_duration(&huge),
            Err(crate::Error::InvalidConfig(_))
        ));
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
        assert!(parse_duration(&format!("{}s", u64::MAX)).is_ok());
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("user", "42").is_ok());
        assert!(validate_id("user", "").is_err());
        assert!(validate_id("server", "   ").is_err());
    }

    #[test]
    fn test_timestamp_monotonic_enough() {
        let a = timestamp_now_millis();
        let b = timestamp_now_millis();
        assert!(b >= a);
    }
}
