//! Staleness classification for cached mappings.
//!
//! Pure functions with no I/O, cheap enough to run on every lookup. A record
//! is fresh only while `now - last_refreshed < ttl`; a record exactly `ttl`
//! old is already stale.

use crate::cache::record::{MappingRecord, RefreshStamp};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Why a record is (or is not) stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StaleReason {
    Fresh,
    Missing,
    NoTimestamp,
    InvalidTimestamp,
    Expired,
}

impl StaleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StaleReason::Fresh => "fresh",
            StaleReason::Missing => "missing",
            StaleReason::NoTimestamp => "no_timestamp",
            StaleReason::InvalidTimestamp => "invalid_timestamp",
            StaleReason::Expired => "expired",
        }
    }

    pub fn is_stale(self) -> bool {
        self != StaleReason::Fresh
    }
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a record, logging a warning for unparsable timestamps.
pub fn classify(record: Option<&MappingRecord>, now: DateTime<Utc>, ttl: Duration) -> StaleReason {
    let Some(record) = record else {
        return StaleReason::Missing;
    };

    match &record.last_refreshed {
        None => StaleReason::NoTimestamp,
        Some(RefreshStamp::Unparsable(raw)) => {
            warn!(
                username = %record.external_username,
                last_refreshed = %raw,
                "Unparsable last_refreshed timestamp, treating mapping as stale"
            );
            StaleReason::InvalidTimestamp
        }
        Some(RefreshStamp::At(at)) => {
            if is_expired(*at, now, ttl) {
                StaleReason::Expired
            } else {
                StaleReason::Fresh
            }
        }
    }
}

pub fn is_stale(record: Option<&MappingRecord>, now: DateTime<Utc>, ttl: Duration) -> bool {
    classify(record, now, ttl).is_stale()
}

fn is_expired(refreshed_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    // A timestamp from the future has age zero
    let age = (now - refreshed_at).to_std().unwrap_or(Duration::ZERO);
    age >= ttl
}
