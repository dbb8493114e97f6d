//! Duration strings for configuration values
//!
//! Accepts the same shape operators already use for compose and Go tooling:
//! one or more `<number><unit>` pairs such as `90s`, `2m`, `1h30m` or `1.5s`.
//! A bare `0` is allowed; negative values are rejected.

use crate::error::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize, value},
    multi::many1,
    sequence::pair,
    Parser,
};
use std::time::Duration;

const NANOS_PER_MICRO: f64 = 1_000.0;
const NANOS_PER_MILLI: f64 = 1_000_000.0;
const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Parse a duration such as `2m`, `90s` or `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(invalid(input, "empty duration"));
    }
    if trimmed.starts_with('-') {
        return Err(invalid(input, "must not be negative"));
    }

    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned == "0" {
        return Ok(Duration::ZERO);
    }

    let (_, segments) = all_consuming(many1(segment))
        .parse(unsigned)
        .map_err(|_| invalid(input, "expected <number><unit> pairs (ns, us, ms, s, m, h)"))?;

    let nanos: f64 = segments.iter().map(|(amount, unit)| amount * unit).sum();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(invalid(input, "out of range"));
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Render a duration the way it would be written in configuration
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs == 0 && millis == 0 {
        return "0s".to_string();
    }
    if secs == 0 {
        return format!("{}ms", millis);
    }

    let mut out = String::new();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 || millis > 0 {
        if millis > 0 {
            out.push_str(&format!("{}.{:03}s", seconds, millis));
        } else {
            out.push_str(&format!("{}s", seconds));
        }
    }
    out
}

fn invalid(input: &str, message: &str) -> Error {
    Error::InvalidDuration {
        input: input.to_string(),
        message: message.to_string(),
    }
}

// Nom parsers

fn segment(input: &str) -> nom::IResult<&str, (f64, f64)> {
    pair(amount, unit).parse(input)
}

fn amount(input: &str) -> nom::IResult<&str, f64> {
    map_res(recognize(pair(digit1, opt(pair(char('.'), digit1)))), |s: &str| {
        s.parse::<f64>()
    })
    .parse(input)
}

/// Unit suffix, as a multiplier in nanoseconds
fn unit(input: &str) -> nom::IResult<&str, f64> {
    alt((
        value(1.0, tag("ns")),
        value(NANOS_PER_MICRO, tag("us")),
        value(NANOS_PER_MICRO, tag("µs")),
        value(NANOS_PER_MILLI, tag("ms")),
        value(NANOS_PER_SEC, tag("s")),
        value(60.0 * NANOS_PER_SEC, tag("m")),
        value(3600.0 * NANOS_PER_SEC, tag("h")),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("10ns").unwrap(), Duration::from_nanos(10));
    }

    #[test]
    fn test_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(" +45s ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_zero() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 s").is_err());
        assert!(parse_duration("5sx").is_err());
    }

    #[test]
    fn test_rejects_negative() {
        let err = parse_duration("-5s").unwrap_err();
        assert!(err.to_string().contains("negative"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3600 + 1)), "1h1s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
