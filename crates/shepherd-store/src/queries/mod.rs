//! SQL query modules plus shared row-decoding helpers.
//!
//! Timestamps are stored as RFC 3339 text and UUIDs as hyphenated text;
//! the helpers here convert between the stored form and domain types.

pub mod claims;
pub mod leases;
pub mod tasks;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn fmt_opt_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt_ts)
}

pub(crate) fn parse_ts(kind: &'static str, id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            kind,
            id: id.to_owned(),
            detail: format!("bad timestamp {raw:?}: {e}"),
        })
}

pub(crate) fn parse_opt_ts(
    kind: &'static str,
    id: &str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| parse_ts(kind, id, &s)).transpose()
}

pub(crate) fn parse_uuid(kind: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        kind,
        id: raw.to_owned(),
        detail: format!("bad uuid: {e}"),
    })
}
