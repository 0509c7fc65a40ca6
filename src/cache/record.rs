//! Mapping records: one per external username.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Metadata keys written by the refresh pipeline
pub mod meta {
    pub const SOURCE_ACTIVE: &str = "source_active";
    pub const TARGET_ACTIVE: &str = "target_active";
    pub const NEEDS_REVIEW: &str = "needs_review";
    pub const IS_PLACEHOLDER: &str = "is_placeholder";
    pub const FALLBACK_REASON: &str = "fallback_reason";
    pub const FALLBACK_STRATEGY: &str = "fallback_strategy";
    pub const REFRESH_ATTEMPTS: &str = "refresh_attempts";
    pub const REFRESH_ERROR: &str = "refresh_error";
    pub const VALIDATION_REASON: &str = "validation_reason";
    pub const RESOLVE_ERROR: &str = "resolve_error";
    /// Contradicting source values held for review
    pub const FETCHED_EMAIL: &str = "fetched_email";
    pub const FETCHED_ID: &str = "fetched_id";
}

/// Resolution state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Mapped,
    Unmapped,
    Deleted,
    FallbackAdmin,
    Placeholder,
    NotFound,
    InactiveSource,
}

impl MappingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStatus::Mapped => "mapped",
            MappingStatus::Unmapped => "unmapped",
            MappingStatus::Deleted => "deleted",
            MappingStatus::FallbackAdmin => "fallback_admin",
            MappingStatus::Placeholder => "placeholder",
            MappingStatus::NotFound => "not_found",
            MappingStatus::InactiveSource => "inactive_source",
        }
    }
}

/// Timestamp of the last refresh as stored in the snapshot.
///
/// Snapshots are hand-editable, so a stored value may not parse, or may not
/// even be a string. It is kept verbatim instead of failing the load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value", into = "String")]
pub enum RefreshStamp {
    At(DateTime<Utc>),
    Unparsable(String),
}

impl RefreshStamp {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            RefreshStamp::At(t) => Some(*t),
            RefreshStamp::Unparsable(_) => None,
        }
    }
}

impl From<String> for RefreshStamp {
    fn from(raw: String) -> Self {
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(t) => RefreshStamp::At(t.with_timezone(&Utc)),
            Err(_) => RefreshStamp::Unparsable(raw),
        }
    }
}

impl From<Value> for RefreshStamp {
    fn from(raw: Value) -> Self {
        match raw {
            Value::String(s) => RefreshStamp::from(s),
            other => RefreshStamp::Unparsable(other.to_string()),
        }
    }
}

impl From<RefreshStamp> for String {
    fn from(stamp: RefreshStamp) -> Self {
        match stamp {
            RefreshStamp::At(t) => t.to_rfc3339(),
            RefreshStamp::Unparsable(raw) => raw,
        }
    }
}

/// Cached mapping from an external identity to a local one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Older snapshots only carry the username as the map key
    #[serde(default)]
    pub external_username: String,
    #[serde(default)]
    pub external_user_id: Option<String>,
    #[serde(default)]
    pub external_display_name: Option<String>,
    #[serde(default)]
    pub external_email: Option<String>,
    #[serde(default)]
    pub local_user_id: Option<i64>,
    #[serde(default)]
    pub local_username: Option<String>,
    #[serde(default)]
    pub local_email: Option<String>,
    pub status: MappingStatus,
    #[serde(default)]
    pub fallback_user_id: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Absent only in snapshots written before staleness tracking
    #[serde(default)]
    pub last_refreshed: Option<RefreshStamp>,
}

impl MappingRecord {
    /// A record with nothing resolved yet.
    pub fn new(external_username: impl Into<String>, status: MappingStatus) -> Self {
        Self {
            external_username: external_username.into(),
            external_user_id: None,
            external_display_name: None,
            external_email: None,
            local_user_id: None,
            local_username: None,
            local_email: None,
            status,
            fallback_user_id: None,
            metadata: BTreeMap::new(),
            last_refreshed: None,
        }
    }

    pub fn meta_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Stamp a write. The result is strictly later than any previous valid
    /// stamp on this record, even if the wall clock stepped backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let next = match self.last_refreshed.as_ref().and_then(RefreshStamp::at) {
            Some(prev) if prev >= now => prev + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_refreshed = Some(RefreshStamp::At(next));
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed.as_ref().and_then(RefreshStamp::at)
    }
}
