//! Identity drift detection.
//!
//! A freshly fetched identity is only accepted if it does not contradict what
//! was cached for the same username. Recycled usernames in the source system
//! otherwise silently re-point ownership to an unrelated account.

use crate::cache::record::MappingRecord;
use crate::services::identity::Identity;
use std::fmt;
use tracing::debug;

/// Why a fetched identity was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationMismatch {
    SourceInactive,
    EmailMismatch,
    IdMismatch,
}

impl ValidationMismatch {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationMismatch::SourceInactive => "source_inactive",
            ValidationMismatch::EmailMismatch => "email_mismatch",
            ValidationMismatch::IdMismatch => "id_mismatch",
        }
    }
}

impl fmt::Display for ValidationMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check `fresh` against the previously cached record.
///
/// A field missing on either side never produces a mismatch.
pub fn validate(
    username: &str,
    fresh: &Identity,
    previous: Option<&MappingRecord>,
) -> Result<(), ValidationMismatch> {
    if !fresh.active {
        debug!(username = %username, "Source identity is inactive");
        return Err(ValidationMismatch::SourceInactive);
    }

    let Some(previous) = previous else {
        return Ok(());
    };

    if let (Some(cached), Some(fetched)) = (
        known(previous.external_email.as_deref()),
        known(fresh.email.as_deref()),
    ) {
        if cached.to_lowercase() != fetched.to_lowercase() {
            debug!(username = %username, "Source email changed since last refresh");
            return Err(ValidationMismatch::EmailMismatch);
        }
    }

    if let (Some(cached), Some(fetched)) = (
        known(previous.external_user_id.as_deref()),
        known(fresh.id.as_deref()),
    ) {
        if cached != fetched {
            debug!(username = %username, "Source account id changed since last refresh");
            return Err(ValidationMismatch::IdMismatch);
        }
    }

    Ok(())
}

fn known(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
