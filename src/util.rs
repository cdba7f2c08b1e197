use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Country recorded for events that arrive without one.
pub const UNKNOWN_COUNTRY: &str = "XX";

const MAX_ENTITY_ID_LEN: usize = 128;
const FALLBACK_ENTITY_ID: &str = "entity";

lazy_static! {
    static ref NON_SLUG_CHARS: Regex = Regex::new(r"[^\w\s-]").unwrap();
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
    static ref BUCKET_FORMAT: Regex = Regex::new(r"^\d{10}$").unwrap();
}

/// Hour bucket key (`YYYYMMDDHH`, UTC) for a timestamp.
pub fn hour_bucket(time: &DateTime<Utc>) -> String {
    time.format("%Y%m%d%H").to_string()
}

pub fn is_valid_bucket(bucket: &str) -> bool {
    BUCKET_FORMAT.is_match(bucket)
}

/// Start of the hour a bucket covers, or `None` for a malformed key.
pub fn bucket_start(bucket: &str) -> Option<DateTime<Utc>> {
    if !is_valid_bucket(bucket) {
        return None;
    }
    NaiveDateTime::parse_from_str(&format!("{}00", bucket), "%Y%m%d%H%M")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// A bucket is open while its hour has not fully elapsed; its counters may still move.
pub fn is_open_bucket(bucket: &str, now: &DateTime<Utc>) -> bool {
    match bucket_start(bucket) {
        Some(start) => start + chrono::Duration::hours(1) > *now,
        None => false,
    }
}

/// Deterministic entity identifier derived from a display name.
///
/// Names that normalise to the same identifier are the same entity, so
/// "NASA" and "nasa" share counters. Applying the function to its own output
/// returns the same value.
pub fn entity_id(name: &str) -> String {
    let lowered: String = name.nfc().collect::<String>().to_lowercase();
    let stripped = NON_SLUG_CHARS.replace_all(&lowered, "");
    let slug = WHITESPACE_RUN.replace_all(stripped.trim(), "-");
    let truncated: String = slug.chars().take(MAX_ENTITY_ID_LEN).collect();
    if truncated.is_empty() {
        FALLBACK_ENTITY_ID.to_string()
    } else {
        truncated
    }
}

pub fn normalize_country(country: Option<&str>) -> String {
    match country.map(str::trim) {
        Some(code) if !code.is_empty() => code.to_uppercase(),
        _ => UNKNOWN_COUNTRY.to_string(),
    }
}

/// Parses RFC 3339 timestamps, falling back to a few naive layouts that are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y%m%dT%H%M%SZ"]
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(value, layout).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Stable article id: the URL when known, else title plus hour bucket.
/// `None` when there is neither a URL nor a timestamp to anchor the title to.
pub fn article_id(url: Option<&str>, title: &str, time: Option<&DateTime<Utc>>) -> Option<String> {
    let basis = match (url, time) {
        (Some(url), _) if !url.is_empty() => url.to_string(),
        (_, Some(time)) => format!("{}||{}", title, hour_bucket(time)),
        _ => return None,
    };
    let mut hasher = Sha256::new();
    hasher.update(basis.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Some(digest[..32].to_string())
}
