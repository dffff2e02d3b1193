use chrono::{DateTime, Duration, Utc};

use crate::error::EngramError;
use crate::thresholds::CHARS_PER_TOKEN;

/// Truncate a string to `max` characters, appending "…" if truncated.
/// Handles multi-byte text correctly via char boundaries.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Token estimate for budget packing: ceil(chars / 3.5), never below 1.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    ((chars as f64) / CHARS_PER_TOKEN).ceil().max(1.0) as usize
}

/// Parse a relative age expression `<N><h|d|w|m>` into the absolute lower
/// bound `now - N units`. Months are 30 days.
pub fn parse_since(expr: &str) -> Result<DateTime<Utc>, EngramError> {
    let expr = expr.trim();
    let bad = || EngramError::InvalidSince(expr.to_string());
    if expr.len() < 2 {
        return Err(bad());
    }
    let (num, unit) = expr.split_at(expr.len() - 1);
    let n: i64 = num.parse().map_err(|_| bad())?;
    if n < 0 {
        return Err(bad());
    }
    let dur = match unit {
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        "w" => Duration::weeks(n),
        "m" => Duration::days(30 * n),
        _ => return Err(bad()),
    };
    Ok(Utc::now() - dur)
}

/// Fractional days between two instants, clamped at zero.
pub fn days_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let secs = (later - earlier).num_milliseconds() as f64 / 1000.0;
    (secs / 86_400.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_short_text() {
        // "hello" = 5 chars / 3.5 → 2 tokens
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn tokens_never_zero() {
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn since_units() {
        let now = Utc::now();
        let h = parse_since("2h").unwrap();
        assert!((now - h).num_hours() >= 2);
        let w = parse_since("1w").unwrap();
        assert!((now - w).num_days() >= 7);
        let m = parse_since("1m").unwrap();
        assert!((now - m).num_days() >= 30);
    }

    #[test]
    fn since_rejects_garbage() {
        assert!(parse_since("").is_err());
        assert!(parse_since("h").is_err());
        assert!(parse_since("12x").is_err());
        assert!(parse_since("-3d").is_err());
    }

    #[test]
    fn truncate_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo…");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn days_between_clamps() {
        let now = Utc::now();
        assert_eq!(days_between(now, now - Duration::hours(5)), 0.0);
        let d = days_between(now - Duration::hours(36), now);
        assert!((d - 1.5).abs() < 0.01);
    }
}
