//! Small string and time helpers shared by the API and the store.

use chrono::{SecondsFormat, Utc};

/// Longest upstream message we echo back to clients
const MESSAGE_LIMIT: usize = 180;

/// Trimmed value, or `None` when absent or blank.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

pub fn is_http_url(value: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

/// Trim and cap an upstream message before it goes into an error body.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(MESSAGE_LIMIT).collect()
}

/// UTC timestamp with millisecond precision, e.g. `2024-05-01T09:30:00.000Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_becomes_none() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(" \t ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some("  flour  ".to_string())).as_deref(),
            Some("flour")
        );
    }

    #[test]
    fn only_web_schemes_count_as_urls() {
        assert!(is_http_url("https://app.example.com/xero"));
        assert!(is_http_url("http://localhost:5173"));
        assert!(!is_http_url("javascript:alert(1)"));
        assert!(!is_http_url("ftp://files.example.com"));
    }

    #[test]
    fn long_messages_are_capped() {
        let message = format!("  {}  ", "é".repeat(300));
        assert_eq!(compact_text(&message).chars().count(), MESSAGE_LIMIT);
    }

    #[test]
    fn timestamps_are_utc_with_millis() {
        let now = now_rfc3339();
        assert!(now.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&now).is_ok());
        assert_eq!(now.split('.').nth(1).map(str::len), Some(4));
    }
}
