//! Freshness window derived from `Age` and `Cache-Control: max-age`
//!
//! The provider tells us how long its key document stays authoritative. The
//! window remaining for our copy is `max-age - Age`. `Cache-Control` may be
//! split over several header lines and carry several directives; all of them
//! are scanned and the **last** `max-age` wins. Directive names are matched
//! case-insensitively with surrounding whitespace ignored.

use std::time::Duration;

use http::HeaderMap;
use http::header::{AGE, CACHE_CONTROL};

use crate::error::DocumentError;

/// Longest freshness window honoured (2^31 seconds, the delta-seconds cap of RFC 9111)
pub const MAX_FRESHNESS: Duration = Duration::from_secs(1 << 31);

/// `max-age` and `Age` as reported by the key endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    /// Lifetime the server grants the document
    pub max_age: Duration,
    /// How long the document has already been cached upstream
    pub age: Duration,
}

impl Freshness {
    /// Time until the next refresh, zero if the document is already stale
    ///
    /// Never longer than [`MAX_FRESHNESS`].
    pub fn delay(&self) -> Duration {
        self.max_age.saturating_sub(self.age).min(MAX_FRESHNESS)
    }

    /// Whether `Age` has reached or passed `max-age`
    pub fn is_stale(&self) -> bool {
        self.age >= self.max_age
    }
}

/// Extract the freshness window from response headers
///
/// # Errors
///
/// Returns [`DocumentError::MissingHeader`] when `Age` or a `max-age` directive
/// is absent, and [`DocumentError::InvalidHeader`] when either value is not a
/// non-negative whole number of seconds.
pub fn freshness_delay(headers: &HeaderMap) -> Result<Freshness, DocumentError> {
    let age = parse_age(headers)?;
    let max_age = parse_max_age(headers)?;
    Ok(Freshness { max_age, age })
}

fn parse_age(headers: &HeaderMap) -> Result<Duration, DocumentError> {
    let value = headers.get(AGE).ok_or(DocumentError::MissingHeader("Age"))?;
    let text = value.to_str().map_err(|_| DocumentError::InvalidHeader {
        name: "Age",
        value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })?;
    parse_seconds("Age", text)
}

fn parse_max_age(headers: &HeaderMap) -> Result<Duration, DocumentError> {
    let mut max_age = None;

    for value in headers.get_all(CACHE_CONTROL) {
        // Non-ASCII header lines cannot carry a max-age we understand
        let Ok(value) = value.to_str() else {
            continue;
        };

        for directive in value.split(',') {
            let Some((name, argument)) = directive.split_once('=') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("max-age") {
                max_age = Some(argument);
            }
        }
    }

    let raw = max_age.ok_or(DocumentError::MissingHeader("Cache-Control max-age"))?;
    parse_seconds("max-age", raw.trim().trim_matches('"'))
}

// delta-seconds: ASCII digits only, no sign
fn parse_seconds(name: &'static str, raw: &str) -> Result<Duration, DocumentError> {
    let invalid = || DocumentError::InvalidHeader {
        name,
        value: raw.to_string(),
    };

    let digits = raw.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    // Too many digits for u64 is still "a very long time"
    Ok(digits
        .parse::<u64>()
        .map_or(Duration::from_secs(u64::MAX), Duration::from_secs))
}
