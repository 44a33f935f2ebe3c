use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};

pub const BOOLEAN_TRUE_TOKENS: &[&str] = &["true", "t", "yes", "y"];
pub const BOOLEAN_FALSE_TOKENS: &[&str] = &["false", "f", "no", "n"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%SZ",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_naive_date(value: &str) -> Result<NaiveDate> {
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime> {
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

/// Parses a date or a date-time into a single timestamp; dates land on midnight.
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    if let Ok(parsed) = parse_naive_datetime(value) {
        return Ok(parsed);
    }
    parse_naive_date(value)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| anyhow!("Failed to parse '{value}' as timestamp"))
}

pub fn parse_boolean_token(value: &str) -> Option<bool> {
    let lowered = value.trim().to_ascii_lowercase();
    if BOOLEAN_TRUE_TOKENS.contains(&lowered.as_str()) {
        Some(true)
    } else if BOOLEAN_FALSE_TOKENS.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_naive_date_supports_multiple_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        assert_eq!(parse_naive_date("2024-05-06").unwrap(), expected);
        assert_eq!(parse_naive_date("2024/05/06").unwrap(), expected);
        assert!(parse_naive_date("06 May 2024").is_err());
    }

    #[test]
    fn parse_timestamp_accepts_dates_and_datetimes() {
        let midnight = parse_timestamp("2024-05-06").expect("date");
        assert_eq!(format_timestamp(&midnight), "2024-05-06 00:00:00");
        let precise = parse_timestamp("2024-05-06T13:45:10").expect("datetime");
        assert_eq!(format_timestamp(&precise), "2024-05-06 13:45:10");
        assert!(parse_timestamp("13:45").is_err());
    }

    #[test]
    fn boolean_tokens_are_case_insensitive() {
        assert_eq!(parse_boolean_token("YES"), Some(true));
        assert_eq!(parse_boolean_token(" f "), Some(false));
        assert_eq!(parse_boolean_token("1"), None);
    }
}
