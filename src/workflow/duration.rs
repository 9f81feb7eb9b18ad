//! Duration Strings
//!
//! Parses and formats durations written as a sequence of decimal numbers
//! with unit suffixes, such as `"300ms"`, `"1.5h"` or `"2h45m"`.
//! Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`.

use std::time::Duration;

const NANOS_PER_UNIT: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3_600 * 1_000_000_000),
];

/// Parses a duration string.
///
/// A bare `"0"` is accepted; any other number needs a unit. Negative
/// durations are rejected.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use flowrunner::workflow::duration::parse_duration;
///
/// assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let text = match text.strip_prefix('+') {
        Some(rest) => rest,
        None if text.starts_with('-') => {
            return Err(format!("negative duration '{}'", input));
        }
        None => text,
    };

    if text == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total: u128 = 0;
    let mut rest = text;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        if unit_len == 0 {
            return Err(format!("missing unit in duration '{}'", input));
        }
        let (unit, tail) = tail.split_at(unit_len);

        let scale = NANOS_PER_UNIT
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| format!("unknown unit '{}' in duration '{}'", unit, input))?;

        let nanos = component_nanos(number, scale).ok_or_else(|| format!("invalid duration '{}'", input))?;
        total = total
            .checked_add(nanos)
            .ok_or_else(|| format!("duration '{}' is out of range", input))?;
        rest = tail;
    }

    let nanos = u64::try_from(total).map_err(|_| format!("duration '{}' is out of range", input))?;
    Ok(Duration::from_nanos(nanos))
}

/// Converts one `<number><unit>` component into nanoseconds.
fn component_nanos(number: &str, scale: u128) -> Option<u128> {
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut nanos = whole.checked_mul(scale)?;

    if !fraction.is_empty() {
        // Digits past nanosecond precision cannot change the result.
        let digits = &fraction[..fraction.len().min(18)];
        let numerator: u128 = digits.parse().ok()?;
        let denominator = 10u128.pow(digits.len() as u32);
        nanos = nanos.checked_add(numerator * scale / denominator)?;
    }

    Some(nanos)
}

/// Formats a duration using the largest unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }

    for (name, scale) in NANOS_PER_UNIT.iter().rev() {
        if *name == "µs" {
            continue;
        }
        if nanos % scale == 0 {
            return format!("{}{}", nanos / scale, name);
        }
    }
    format!("{}ns", nanos)
}

/// Serde adapter for optional durations written as duration strings.
pub mod serde_opt {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_str(&format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|text| parse_duration(&text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("3us").unwrap(), Duration::from_micros(3));
        assert_eq!(parse_duration("3µs").unwrap(), Duration::from_micros(3));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_compound_and_fraction() {
        assert_eq!(parse_duration("2h45m").unwrap(), Duration::from_secs(9900));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(".5m").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("+1s").unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("1x").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("1..5s").is_err());
        assert!(parse_duration(".s").is_err());
    }

    #[test]
    fn test_parse_out_of_range() {
        let max = u128::MAX;
        let err = parse_duration(&format!("{}ns{}ns", max, max)).unwrap_err();
        assert!(err.contains("out of range"), "{}", err);

        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
        assert!(parse_duration(&format!("{}ns", u128::from(u64::MAX) + 1)).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_format_parses_back() {
        for d in [Duration::from_secs(120), Duration::from_micros(42), Duration::from_nanos(5)] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
