//! Column conversion helpers shared by the row mappers.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;

pub(crate) fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn ms_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn opt_ms_to_utc(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|v| ms_to_utc(idx, v)).transpose()
}

/// Escape LIKE wildcards, using a backslash as the escape character.
pub(crate) fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `%needle%` for a case-insensitive LIKE.
pub(crate) fn like_pattern(needle: &str) -> String {
    format!("%{}%", escape_like(&needle.trim().to_lowercase()))
}
