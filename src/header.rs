//! `Retry-After` parsing and deadline arithmetic.
//!
//! The header carries either a delay in seconds (`Retry-After: 120`) or an HTTP-date
//! (`Retry-After: Wed, 21 Oct 2015 07:28:00 GMT`). Both are resolved into an absolute
//! deadline relative to the instant the response was observed.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

/// Errors produced while reading a `Retry-After` value or a stored deadline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderParseError {
    /// The header value contains bytes outside visible ASCII.
    #[error("Retry-After value is not valid header text")]
    NotText,
    /// Neither delta-seconds nor a recognised date.
    #[error("could not parse `{0}` as delta-seconds or an HTTP-date")]
    Unrecognized(String),
    /// The value parsed but the resulting deadline cannot be represented.
    #[error("Retry-After value `{0}` is out of range")]
    OutOfRange(String),
}

/// A parsed `Retry-After` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Whole seconds from the moment the response was observed.
    Delay(i64),
    /// Absolute deadline.
    Date(DateTime<Utc>),
}

impl RetryAfter {
    /// Parse a raw header value.
    ///
    /// Numeric values are truncated toward zero to whole seconds, so `2.9` waits two
    /// seconds. Everything else must be an HTTP-date; the weekday name is not checked
    /// against the calendar date.
    pub fn parse(value: &str) -> Result<Self, HeaderParseError> {
        let trimmed = value.trim();
        if let Some(seconds) = parse_delay(trimmed) {
            return Ok(RetryAfter::Delay(seconds));
        }
        parse_http_date(trimmed)
            .map(RetryAfter::Date)
            .ok_or_else(|| HeaderParseError::Unrecognized(value.to_string()))
    }

    /// Parse a header value, rejecting non-text bytes.
    pub fn from_header_value(value: &HeaderValue) -> Result<Self, HeaderParseError> {
        let text = value.to_str().map_err(|_| HeaderParseError::NotText)?;
        Self::parse(text)
    }

    /// Resolve the signal into an absolute deadline.
    pub fn deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, HeaderParseError> {
        match *self {
            RetryAfter::Date(at) => Ok(at),
            RetryAfter::Delay(seconds) => TimeDelta::try_seconds(seconds)
                .and_then(|delta| now.checked_add_signed(delta))
                .ok_or_else(|| HeaderParseError::OutOfRange(seconds.to_string())),
        }
    }
}

fn parse_delay(value: &str) -> Option<i64> {
    if let Ok(seconds) = value.parse::<i64>() {
        return Some(seconds);
    }
    // "inf" and "NaN" parse as floats but are not numbers a server would send.
    if !value.bytes().all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E')) {
        return None;
    }
    let seconds = value.parse::<f64>().ok().filter(|s| s.is_finite())?;
    // Saturating float-to-int cast.
    Some(seconds.trunc() as i64)
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let naive = |rest: &str, fmt: &str| NaiveDateTime::parse_from_str(rest, fmt).ok();

    let parsed = match value.split_once(", ") {
        // IMF-fixdate: Sun, 06 Nov 1994 08:49:37 GMT
        // RFC 850:     Sunday, 06-Nov-94 08:49:37 GMT
        Some((_, rest)) => naive(rest, "%d %b %Y %H:%M:%S GMT")
            .or_else(|| naive(rest, "%d-%b-%y %H:%M:%S GMT")),
        // asctime:     Sun Nov  6 08:49:37 1994
        None => value.split_once(' ').and_then(|(_, rest)| naive(rest.trim_start(), "%b %e %H:%M:%S %Y")),
    };
    if let Some(naive) = parsed {
        return Some(naive.and_utc());
    }

    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// The last value of `name` in `headers`; later occurrences win over earlier ones.
pub fn last_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a HeaderValue> {
    headers.get_all(name).iter().last()
}

/// Render an instant the way deadlines are stored and reported:
/// ISO-8601 with six fractional digits and an explicit offset.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse a timestamp previously produced by [`format_timestamp`].
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).ok().map(|at| at.with_timezone(&Utc))
}

/// A deadline observed on a response, together with when it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub until: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// Cache lifetime for this deadline: whole-second ceiling of the distance between
    /// the observation and the deadline, plus `margin`.
    pub fn ttl(&self, margin: Duration) -> Duration {
        let distance = self.until - self.observed_at;
        let whole = distance.num_seconds().unsigned_abs();
        let ceil = if distance.subsec_nanos() != 0 { whole + 1 } else { whole };
        Duration::from_secs(ceil).saturating_add(margin)
    }
}
