//! What to do with a mapping that cannot be refreshed or failed validation.

use crate::cache::record::{meta, MappingRecord, MappingStatus};
use crate::cache::redact::sanitize;
use crate::cache::store::MappingStore;
use crate::cache::validator::ValidationMismatch;
use crate::error::{ConfigError, FetchError};
use crate::metrics::SharedMetrics;
use crate::services::identity::Identity;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{info, warn};

/// Fallback policy, chosen once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackStrategy {
    /// Drop the mapping entirely
    Skip,
    /// Point the mapping at an administrator account for later review.
    /// Without an admin id every resolution degrades to `Skip`.
    AssignAdmin { admin_id: Option<i64> },
    /// Keep an unresolved placeholder carrying the source-side data
    CreatePlaceholder,
}

impl FallbackStrategy {
    pub fn parse(name: &str, admin_id: Option<i64>) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(FallbackStrategy::Skip),
            "assign_admin" => Ok(FallbackStrategy::AssignAdmin { admin_id }),
            "create_placeholder" => Ok(FallbackStrategy::CreatePlaceholder),
            _ => Err(ConfigError::UnknownStrategy(name.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackStrategy::Skip => "skip",
            FallbackStrategy::AssignAdmin { .. } => "assign_admin",
            FallbackStrategy::CreatePlaceholder => "create_placeholder",
        }
    }

    /// Whether `assign_admin` was selected without an admin id.
    pub fn is_degraded(&self) -> bool {
        matches!(self, FallbackStrategy::AssignAdmin { admin_id: None })
    }
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the resolver was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackReason {
    UserNotFound,
    RefreshExhausted,
    LookupRejected,
    Validation(ValidationMismatch),
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::UserNotFound => "user_not_found",
            FallbackReason::RefreshExhausted => "refresh_exhausted",
            FallbackReason::LookupRejected => "lookup_rejected",
            FallbackReason::Validation(mismatch) => mismatch.as_str(),
        }
    }
}

/// Cancelled lookups never reach the resolver; they map to exhaustion only to
/// keep the conversion total.
impl From<&FetchError> for FallbackReason {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::NotFound { .. } => FallbackReason::UserNotFound,
            FetchError::Exhausted { .. } | FetchError::Cancelled => {
                FallbackReason::RefreshExhausted
            }
            FetchError::Rejected { .. } => FallbackReason::LookupRejected,
        }
    }
}

impl From<ValidationMismatch> for FallbackReason {
    fn from(mismatch: ValidationMismatch) -> Self {
        FallbackReason::Validation(mismatch)
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a fallback resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The mapping was removed; callers get no mapping
    Removed,
    Record(MappingRecord),
}

impl Resolution {
    pub fn into_record(self) -> Option<MappingRecord> {
        match self {
            Resolution::Removed => None,
            Resolution::Record(record) => Some(record),
        }
    }
}

/// Everything the resolver knows about the failed refresh.
#[derive(Debug, Clone, Copy)]
pub struct FallbackInput<'a> {
    pub username: &'a str,
    pub reason: FallbackReason,
    pub previous: Option<&'a MappingRecord>,
    pub fetched: Option<&'a Identity>,
    /// Error text from the failed lookup, if any
    pub diagnostic: Option<&'a str>,
}

/// Applies the configured strategy to the store. Never fails.
#[derive(Clone)]
pub struct FallbackResolver {
    strategy: FallbackStrategy,
    store: MappingStore,
    metrics: SharedMetrics,
}

impl FallbackResolver {
    pub fn new(strategy: FallbackStrategy, store: MappingStore, metrics: SharedMetrics) -> Self {
        if strategy.is_degraded() {
            warn!("fallback_strategy is assign_admin but no fallback_admin_user_id is set; unresolvable mappings will be skipped");
        }
        Self {
            strategy,
            store,
            metrics,
        }
    }

    pub fn strategy(&self) -> FallbackStrategy {
        self.strategy
    }

    pub async fn resolve(&self, input: FallbackInput<'_>, now: DateTime<Utc>) -> Resolution {
        let FallbackInput {
            username, reason, ..
        } = input;

        let effective = match self.strategy {
            FallbackStrategy::AssignAdmin { admin_id: None } => {
                warn!(
                    username = %username,
                    reason = %reason,
                    "assign_admin fallback has no admin id configured, skipping mapping instead"
                );
                FallbackStrategy::Skip
            }
            other => other,
        };
        self.metrics.record_fallback(effective.as_str(), reason.as_str());

        match effective {
            FallbackStrategy::Skip => {
                self.store.remove(username).await;
                info!(username = %username, reason = %reason, "Fallback: mapping removed");
                Resolution::Removed
            }
            FallbackStrategy::AssignAdmin {
                admin_id: Some(admin_id),
            } => {
                let mut record = base_record(&input, effective);
                record.local_user_id = Some(admin_id);
                record.fallback_user_id = Some(admin_id);
                record.status = MappingStatus::FallbackAdmin;
                record.set_meta(meta::NEEDS_REVIEW, true);
                record.set_meta(meta::IS_PLACEHOLDER, false);

                let record = self.store.put(record, now).await;
                info!(
                    username = %username,
                    reason = %reason,
                    admin_id = admin_id,
                    "Fallback: mapping assigned to admin"
                );
                Resolution::Record(record)
            }
            FallbackStrategy::CreatePlaceholder => {
                let mut record = base_record(&input, effective);
                record.local_user_id = None;
                record.fallback_user_id = None;
                record.status = MappingStatus::Placeholder;
                record.set_meta(meta::IS_PLACEHOLDER, true);
                record.set_meta(meta::NEEDS_REVIEW, true);

                let record = self.store.put(record, now).await;
                info!(username = %username, reason = %reason, "Fallback: placeholder created");
                Resolution::Record(record)
            }
            // Degraded admin assignment was rewritten to Skip above
            FallbackStrategy::AssignAdmin { admin_id: None } => Resolution::Removed,
        }
    }
}

/// Previous record (or a blank one) overlaid with whatever the source returned.
///
/// On identity drift the cached attributes stay authoritative and the
/// contradicting values are only recorded for review, so the next refresh
/// detects the same drift again.
fn base_record(input: &FallbackInput<'_>, strategy: FallbackStrategy) -> MappingRecord {
    let mut record = input
        .previous
        .cloned()
        .unwrap_or_else(|| MappingRecord::new(input.username, MappingStatus::Unmapped));
    record.metadata.remove(meta::FETCHED_EMAIL);
    record.metadata.remove(meta::FETCHED_ID);

    let drifted = input.previous.is_some()
        && matches!(
            input.reason,
            FallbackReason::Validation(ValidationMismatch::EmailMismatch)
                | FallbackReason::Validation(ValidationMismatch::IdMismatch)
        );

    if let Some(identity) = input.fetched {
        if drifted {
            if let Some(email) = &identity.email {
                record.set_meta(meta::FETCHED_EMAIL, email.as_str());
            }
            if let Some(id) = &identity.id {
                record.set_meta(meta::FETCHED_ID, id.as_str());
            }
        } else {
            if identity.id.is_some() {
                record.external_user_id = identity.id.clone();
            }
            if identity.display_name.is_some() {
                record.external_display_name = identity.display_name.clone();
            }
            if identity.email.is_some() {
                record.external_email = identity.email.clone();
            }
        }
        record.set_meta(meta::SOURCE_ACTIVE, identity.active);
    }

    record.set_meta(meta::FALLBACK_REASON, input.reason.as_str());
    record.set_meta(meta::FALLBACK_STRATEGY, strategy.as_str());
    if let FallbackReason::Validation(mismatch) = input.reason {
        record.set_meta(meta::VALIDATION_REASON, mismatch.as_str());
    }
    match input.diagnostic {
        Some(diagnostic) => record.set_meta(meta::REFRESH_ERROR, sanitize(diagnostic)),
        None => {
            record.metadata.remove(meta::REFRESH_ERROR);
        }
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::identity;
    use crate::metrics::Metrics;
    use std::sync::Arc;

    fn resolver(strategy: FallbackStrategy) -> (FallbackResolver, MappingStore, SharedMetrics) {
        let store = MappingStore::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        (
            FallbackResolver::new(strategy, store.clone(), metrics.clone()),
            store,
            metrics,
        )
    }

    fn previous(username: &str) -> MappingRecord {
        let mut record = MappingRecord::new(username, MappingStatus::Mapped);
        record.local_user_id = Some(314);
        record.external_email = Some(format!("{username}@co.com"));
        record
    }

    #[tokio::test]
    async fn test_skip_removes_mapping() {
        let (resolver, store, metrics) = resolver(FallbackStrategy::Skip);
        store.put(previous("bob.wilson"), Utc::now()).await;
        let prev = store.get("bob.wilson").await;

        let resolution = resolver
            .resolve(
                FallbackInput {
                    username: "bob.wilson",
                    reason: FallbackReason::RefreshExhausted,
                    previous: prev.as_ref(),
                    fetched: None,
                    diagnostic: Some("connection reset"),
                },
                Utc::now(),
            )
            .await;

        assert_eq!(resolution, Resolution::Removed);
        assert!(store.get("bob.wilson").await.is_none());
        assert_eq!(metrics.fallback_count("skip", "refresh_exhausted"), 1);
    }

    #[tokio::test]
    async fn test_assign_admin() {
        let (resolver, store, metrics) = resolver(FallbackStrategy::AssignAdmin {
            admin_id: Some(999),
        });
        let prev = previous("jane.smith");
        let fetched = identity("jane.smith@other.com");

        let record = resolver
            .resolve(
                FallbackInput {
                    username: "jane.smith",
                    reason: ValidationMismatch::EmailMismatch.into(),
                    previous: Some(&prev),
                    fetched: Some(&fetched),
                    diagnostic: None,
                },
                Utc::now(),
            )
            .await
            .into_record()
            .unwrap();

        assert_eq!(record.status, MappingStatus::FallbackAdmin);
        assert_eq!(record.local_user_id, Some(999));
        assert_eq!(record.fallback_user_id, Some(999));
        assert!(record.meta_flag(meta::NEEDS_REVIEW));
        assert_eq!(record.metadata[meta::VALIDATION_REASON], "email_mismatch");
        // Cached identity stays; the drifted values are kept aside
        assert_eq!(record.external_email.as_deref(), Some("jane.smith@co.com"));
        assert_eq!(record.external_user_id, None);
        assert_eq!(record.metadata[meta::FETCHED_EMAIL], "jane.smith@other.com");
        assert_eq!(record.metadata[meta::FETCHED_ID], "ext-jane.smith");
        assert!(record.last_refreshed.is_some());
        assert_eq!(store.get("jane.smith").await, Some(record));
        assert_eq!(metrics.fallback_count("assign_admin", "email_mismatch"), 1);
    }

    #[tokio::test]
    async fn test_assign_admin_without_id_degrades_to_skip() {
        let (resolver, store, metrics) =
            resolver(FallbackStrategy::AssignAdmin { admin_id: None });
        store.put(previous("carol"), Utc::now()).await;

        let resolution = resolver
            .resolve(
                FallbackInput {
                    username: "carol",
                    reason: FallbackReason::UserNotFound,
                    previous: None,
                    fetched: None,
                    diagnostic: None,
                },
                Utc::now(),
            )
            .await;

        assert_eq!(resolution, Resolution::Removed);
        assert!(store.get("carol").await.is_none());
        assert_eq!(metrics.fallback_count("skip", "user_not_found"), 1);
    }

    #[tokio::test]
    async fn test_placeholder_keeps_source_data() {
        let (resolver, _store, metrics) = resolver(FallbackStrategy::CreatePlaceholder);
        let prev = previous("dave");
        let mut fetched = identity("dave@co.com");
        fetched.active = false;

        let record = resolver
            .resolve(
                FallbackInput {
                    username: "dave",
                    reason: ValidationMismatch::SourceInactive.into(),
                    previous: Some(&prev),
                    fetched: Some(&fetched),
                    diagnostic: Some("Bearer abcdefghijklmnop expired"),
                },
                Utc::now(),
            )
            .await
            .into_record()
            .unwrap();

        assert_eq!(record.status, MappingStatus::Placeholder);
        assert_eq!(record.local_user_id, None);
        assert!(record.meta_flag(meta::IS_PLACEHOLDER));
        assert!(record.meta_flag(meta::NEEDS_REVIEW));
        assert!(!record.meta_flag(meta::SOURCE_ACTIVE));
        assert_eq!(record.external_display_name.as_deref(), Some("dave@co.com"));
        let error = record.metadata[meta::REFRESH_ERROR].as_str().unwrap();
        assert!(!error.contains("abcdefghijklmnop"));
        assert_eq!(
            metrics.fallback_count("create_placeholder", "source_inactive"),
            1
        );
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            FallbackStrategy::parse("Skip", None),
            Ok(FallbackStrategy::Skip)
        );
        assert_eq!(
            FallbackStrategy::parse("create_placeholder", Some(3)),
            Ok(FallbackStrategy::CreatePlaceholder)
        );
        assert!(FallbackStrategy::parse("assign_admin", None)
            .unwrap()
            .is_degraded());
        assert!(FallbackStrategy::parse("nope", None).is_err());
    }
}
