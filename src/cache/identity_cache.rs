//! The identity mapping cache.
//!
//! Lookups are served from memory while fresh. A stale mapping goes through
//! the refresh pipeline: fetch under the concurrency bound, validate against
//! the cached record, resolve a local user, and fall back when any of that
//! fails. No refresh failure is ever returned to the caller.

use crate::cache::fallback::{FallbackInput, FallbackReason, FallbackResolver, Resolution};
use crate::cache::fetcher::{Fetched, RetryPolicy, RetryingFetcher, MAX_RETRIES_CEILING};
use crate::cache::limiter::ConcurrencyLimiter;
use crate::cache::persistence::SnapshotFile;
use crate::cache::record::{meta, MappingRecord, MappingStatus};
use crate::cache::redact::sanitize;
use crate::cache::staleness::{classify, StaleReason};
use crate::cache::store::MappingStore;
use crate::cache::validator::validate;
use crate::config::CacheConfig;
use crate::error::{FetchError, PersistenceError};
use crate::metrics::SharedMetrics;
use crate::services::identity::IdentitySource;
use crate::services::local::LocalResolver;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of running the refresh pipeline for one username.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Fetched, validated and written
    Refreshed(MappingRecord),
    /// The fallback strategy decided the result
    Fallback {
        reason: FallbackReason,
        resolution: Resolution,
    },
    /// The cache is shutting down; the record was left untouched
    Deferred(Option<MappingRecord>),
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed(_))
    }

    pub fn record(&self) -> Option<&MappingRecord> {
        match self {
            RefreshOutcome::Refreshed(record) => Some(record),
            RefreshOutcome::Fallback {
                resolution: Resolution::Record(record),
                ..
            } => Some(record),
            RefreshOutcome::Fallback { .. } => None,
            RefreshOutcome::Deferred(record) => record.as_ref(),
        }
    }

    pub fn into_record(self) -> Option<MappingRecord> {
        match self {
            RefreshOutcome::Refreshed(record) => Some(record),
            RefreshOutcome::Fallback { resolution, .. } => resolution.into_record(),
            RefreshOutcome::Deferred(record) => record,
        }
    }
}

/// Per-username line of a batch report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemResult {
    pub username: String,
    pub stale_reason: &'static str,
    pub success: bool,
    /// Status after the refresh; `None` when the mapping was removed
    pub status: Option<MappingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<&'static str>,
}

/// Summary of a batch refresh.
///
/// `stale == 0` means nothing needed refreshing; `stale > 0` with
/// `succeeded == 0` means everything failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchRefreshReport {
    pub examined: usize,
    pub stale: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Classification of every examined username, fresh included
    pub reasons: BTreeMap<String, usize>,
    pub per_item: Vec<ItemResult>,
}

pub struct IdentityCache {
    config: CacheConfig,
    store: MappingStore,
    fetcher: RetryingFetcher,
    resolver: Arc<dyn LocalResolver>,
    fallback: FallbackResolver,
    snapshot: Option<SnapshotFile>,
    metrics: SharedMetrics,
}

impl IdentityCache {
    /// An empty cache. Use [`IdentityCache::open`] to start from the snapshot.
    pub fn new(
        config: CacheConfig,
        source: Arc<dyn IdentitySource>,
        resolver: Arc<dyn LocalResolver>,
        metrics: SharedMetrics,
    ) -> Self {
        Self::with_store(config, source, resolver, metrics, MappingStore::new())
    }

    /// Build the cache and load the configured snapshot.
    ///
    /// A snapshot that cannot be read is logged and the cache starts empty.
    pub async fn open(
        config: CacheConfig,
        source: Arc<dyn IdentitySource>,
        resolver: Arc<dyn LocalResolver>,
        metrics: SharedMetrics,
    ) -> Self {
        let records = match &config.snapshot_path {
            Some(path) => match SnapshotFile::new(path.clone()).load(Utc::now()).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load mapping snapshot, starting with an empty table"
                    );
                    Default::default()
                }
            },
            None => Default::default(),
        };
        metrics.set_mappings(records.len());

        Self::with_store(
            config,
            source,
            resolver,
            metrics,
            MappingStore::from_records(records),
        )
    }

    fn with_store(
        config: CacheConfig,
        source: Arc<dyn IdentitySource>,
        resolver: Arc<dyn LocalResolver>,
        metrics: SharedMetrics,
        store: MappingStore,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_refreshes);
        let bound = limiter.bound();
        let fetcher = RetryingFetcher::new(source, limiter, metrics.clone());
        let fallback = FallbackResolver::new(config.fallback, store.clone(), metrics.clone());
        let snapshot = config.snapshot_path.clone().map(SnapshotFile::new);

        info!(
            refresh_interval_secs = config.refresh_interval.as_secs(),
            fallback = %config.fallback,
            max_retries = config.retry.max_retries(),
            max_concurrent_refreshes = bound,
            persistent = snapshot.is_some(),
            "Identity cache ready"
        );

        Self {
            config,
            store,
            fetcher,
            resolver,
            fallback,
            snapshot,
            metrics,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Mapping for `username`.
    ///
    /// A fresh record is returned without any I/O. A stale one is returned
    /// as-is unless `auto_refresh` is set, in which case the refresh
    /// pipeline decides the answer.
    pub async fn get_mapping(&self, username: &str, auto_refresh: bool) -> Option<MappingRecord> {
        let cached = self.store.get(username).await;
        let reason = classify(cached.as_ref(), Utc::now(), self.config.refresh_interval);

        if !reason.is_stale() {
            debug!(username = %username, "Mapping cache hit");
            return cached;
        }

        self.metrics.record_staleness(reason.as_str());
        if !auto_refresh {
            debug!(username = %username, reason = %reason, "Serving stale mapping without refresh");
            return cached;
        }

        info!(username = %username, reason = %reason, "Refreshing stale mapping");
        let outcome = self.run_pipeline(username, &self.config.retry).await;
        self.persist().await;
        outcome.into_record()
    }

    /// Run the refresh pipeline for `username` regardless of staleness.
    pub async fn refresh(&self, username: &str) -> RefreshOutcome {
        let outcome = self.run_pipeline(username, &self.config.retry).await;
        self.persist().await;
        outcome
    }

    /// Refresh every stale username in `usernames`, or in the whole table
    /// when `None`.
    ///
    /// Staleness is classified for all names before any lookup. At most
    /// `limit` stale names are refreshed. Items run concurrently under the
    /// shared bound and the table is persisted once at the end.
    pub async fn batch_refresh(
        &self,
        usernames: Option<Vec<String>>,
        max_retries_per_item: Option<u32>,
        limit: Option<usize>,
    ) -> BatchRefreshReport {
        let table = self.store.snapshot().await;
        let names: Vec<String> = match usernames {
            Some(names) => {
                let mut seen = HashSet::new();
                names
                    .into_iter()
                    .filter(|name| seen.insert(name.clone()))
                    .collect()
            }
            None => {
                let mut names: Vec<String> = table.keys().cloned().collect();
                names.sort();
                names
            }
        };

        let now = Utc::now();
        let mut report = BatchRefreshReport {
            examined: names.len(),
            ..Default::default()
        };
        let mut stale = Vec::new();
        for name in names {
            let reason = classify(table.get(&name), now, self.config.refresh_interval);
            *report.reasons.entry(reason.as_str().to_string()).or_insert(0) += 1;
            if reason.is_stale() {
                self.metrics.record_staleness(reason.as_str());
                stale.push((name, reason));
            }
        }
        report.stale = stale.len();
        drop(table);

        if let Some(limit) = limit {
            if stale.len() > limit {
                info!(stale = stale.len(), limit = limit, "Batch limited, deferring the rest");
                stale.truncate(limit);
            }
        }
        report.attempted = stale.len();

        if stale.is_empty() {
            info!(examined = report.examined, "Batch refresh: nothing is stale");
            return report;
        }

        let policy = self.item_policy(max_retries_per_item);
        let started = Instant::now();

        let results = join_all(stale.iter().map(|(name, reason)| {
            let policy = &policy;
            async move {
                let outcome = self.run_pipeline(name, policy).await;
                item_result(name, *reason, &outcome)
            }
        }))
        .await;

        self.persist().await;

        report.succeeded = results.iter().filter(|item| item.success).count();
        report.failed = results.len() - report.succeeded;
        report.per_item = results;

        info!(
            examined = report.examined,
            stale = report.stale,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch refresh complete"
        );
        report
    }

    /// Count of every cached record by staleness classification.
    pub async fn staleness_report(&self, now: DateTime<Utc>) -> BTreeMap<StaleReason, usize> {
        let table = self.store.snapshot().await;
        let mut counts = BTreeMap::new();
        for record in table.values() {
            let reason = classify(Some(record), now, self.config.refresh_interval);
            *counts.entry(reason).or_insert(0) += 1;
        }
        counts
    }

    /// Copy of every record, ordered by username.
    pub async fn snapshot(&self) -> Vec<MappingRecord> {
        let mut records: Vec<MappingRecord> = self.store.snapshot().await.into_values().collect();
        records.sort_by(|a, b| a.external_username.cmp(&b.external_username));
        records
    }

    pub async fn len(&self) -> usize {
        self.store.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.store.is_empty().await
    }

    /// Stop starting source lookups. Lookups already running finish; anything
    /// still waiting for a slot leaves its record untouched.
    pub fn close(&self) {
        self.fetcher.limiter().close();
    }

    /// [`close`](Self::close), then write the table out.
    pub async fn shutdown(&self) -> Result<(), PersistenceError> {
        self.close();
        info!(mappings = self.store.len().await, "Identity cache shutting down");
        self.flush().await
    }

    /// Write the table to the snapshot file now. A no-op without a path.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        match &self.snapshot {
            Some(file) => file.save(&self.store.snapshot().await).await,
            None => Ok(()),
        }
    }

    fn item_policy(&self, max_retries: Option<u32>) -> RetryPolicy {
        let Some(max_retries) = max_retries else {
            return self.config.retry.clone();
        };
        match self.config.retry.with_max_retries(max_retries) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "Per-item retry override rejected, clamping to ceiling");
                self.config
                    .retry
                    .with_max_retries(MAX_RETRIES_CEILING)
                    .unwrap_or_else(|_| self.config.retry.clone())
            }
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Failed to persist mapping snapshot, in-memory table is still current");
            self.metrics.record_persist_failure();
        }
    }

    async fn run_pipeline(&self, username: &str, policy: &RetryPolicy) -> RefreshOutcome {
        let started = Instant::now();
        let previous = self.store.get(username).await;
        if self.fetcher.limiter().is_closed() {
            debug!(username = %username, "Cache closed, not refreshing");
            return RefreshOutcome::Deferred(previous);
        }

        let outcome = match self.fetcher.fetch(username, policy).await {
            Ok(fetched) => match validate(username, &fetched.identity, previous.as_ref()) {
                Ok(()) => {
                    let record = self.accept(username, previous, fetched).await;
                    self.metrics
                        .record_refresh(true, started.elapsed().as_secs_f64());
                    RefreshOutcome::Refreshed(record)
                }
                Err(mismatch) => {
                    warn!(
                        username = %username,
                        reason = %mismatch,
                        "Fetched identity contradicts cached mapping"
                    );
                    self.metrics
                        .record_refresh(false, started.elapsed().as_secs_f64());
                    let reason = FallbackReason::from(mismatch);
                    let resolution = self
                        .fallback
                        .resolve(
                            FallbackInput {
                                username,
                                reason,
                                previous: previous.as_ref(),
                                fetched: Some(&fetched.identity),
                                diagnostic: None,
                            },
                            Utc::now(),
                        )
                        .await;
                    RefreshOutcome::Fallback { reason, resolution }
                }
            },
            Err(FetchError::Cancelled) => RefreshOutcome::Deferred(previous),
            Err(err) => {
                self.metrics
                    .record_refresh(false, started.elapsed().as_secs_f64());
                let reason = FallbackReason::from(&err);
                let diagnostic = err.to_string();
                let resolution = self
                    .fallback
                    .resolve(
                        FallbackInput {
                            username,
                            reason,
                            previous: previous.as_ref(),
                            fetched: None,
                            diagnostic: Some(&diagnostic),
                        },
                        Utc::now(),
                    )
                    .await;
                RefreshOutcome::Fallback { reason, resolution }
            }
        };

        self.metrics.set_mappings(self.store.len().await);
        outcome
    }

    /// Merge a validated identity into the cached record and store it.
    async fn accept(
        &self,
        username: &str,
        previous: Option<MappingRecord>,
        fetched: Fetched,
    ) -> MappingRecord {
        let Fetched { identity, attempts } = fetched;
        let mut record =
            previous.unwrap_or_else(|| MappingRecord::new(username, MappingStatus::Unmapped));

        record.external_user_id = identity.id.or(record.external_user_id);
        record.external_display_name = identity.display_name.or(record.external_display_name);
        record.external_email = identity.email.or(record.external_email);

        // A previous fallback assignment is not a real resolution
        if record.status == MappingStatus::FallbackAdmin {
            record.local_user_id = None;
        }
        record.fallback_user_id = None;
        for key in [
            meta::FALLBACK_REASON,
            meta::FALLBACK_STRATEGY,
            meta::REFRESH_ERROR,
            meta::VALIDATION_REASON,
            meta::RESOLVE_ERROR,
            meta::IS_PLACEHOLDER,
            meta::NEEDS_REVIEW,
            meta::FETCHED_EMAIL,
            meta::FETCHED_ID,
        ] {
            record.metadata.remove(key);
        }
        record.set_meta(meta::SOURCE_ACTIVE, identity.active);
        record.set_meta(meta::REFRESH_ATTEMPTS, attempts);

        record.status = if record.local_user_id.is_some() {
            MappingStatus::Mapped
        } else {
            self.resolve_local(username, &mut record).await
        };

        let record = self.store.put(record, Utc::now()).await;
        info!(
            username = %username,
            status = record.status.as_str(),
            attempts = attempts,
            "Mapping refreshed"
        );
        record
    }

    /// First-time resolution of the local user by email.
    async fn resolve_local(&self, username: &str, record: &mut MappingRecord) -> MappingStatus {
        let Some(email) = record
            .external_email
            .clone()
            .filter(|email| !email.trim().is_empty())
        else {
            debug!(username = %username, "No email to resolve a local user with");
            return MappingStatus::Unmapped;
        };

        match self.resolver.resolve_by_email(&email).await {
            Ok(Some(local_id)) => {
                record.local_user_id = Some(local_id);
                record.local_email = Some(email);
                MappingStatus::Mapped
            }
            Ok(None) => {
                debug!(username = %username, "No local user matches source email");
                MappingStatus::Unmapped
            }
            Err(e) => {
                let message = sanitize(&e.to_string());
                warn!(username = %username, error = %message, "Local user resolution failed");
                record.set_meta(meta::RESOLVE_ERROR, message);
                MappingStatus::Unmapped
            }
        }
    }
}

fn item_result(username: &str, stale_reason: StaleReason, outcome: &RefreshOutcome) -> ItemResult {
    ItemResult {
        username: username.to_string(),
        stale_reason: stale_reason.as_str(),
        success: outcome.is_success(),
        status: outcome.record().map(|record| record.status),
        fallback_reason: match outcome {
            RefreshOutcome::Fallback { reason, .. } => Some(reason.as_str()),
            RefreshOutcome::Refreshed(_) | RefreshOutcome::Deferred(_) => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fallback::FallbackStrategy;
    use crate::cache::record::RefreshStamp;
    use crate::cache::testing::{identity, CountingResolver, ScriptedSource, Step};
    use crate::metrics::Metrics;
    use crate::services::identity::SourceError;
    use crate::services::local::NoopResolver;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn config(fallback: FallbackStrategy) -> CacheConfig {
        CacheConfig {
            refresh_interval: Duration::from_secs(3_600),
            fallback,
            retry: RetryPolicy::new(
                1,
                Duration::from_millis(1),
                Duration::from_millis(4),
                Duration::from_millis(200),
            )
            .unwrap(),
            max_concurrent_refreshes: 5,
            snapshot_path: None,
        }
    }

    fn cache_with(
        config: CacheConfig,
        source: Arc<ScriptedSource>,
        resolver: Arc<dyn LocalResolver>,
        records: Vec<MappingRecord>,
    ) -> (IdentityCache, SharedMetrics) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = MappingStore::from_records(
            records
                .into_iter()
                .map(|record| (record.external_username.clone(), record))
                .collect(),
        );
        (
            IdentityCache::with_store(config, source, resolver, metrics.clone(), store),
            metrics,
        )
    }

    fn mapped(username: &str, email: &str, local_id: i64, age: ChronoDuration) -> MappingRecord {
        let mut record = MappingRecord::new(username, MappingStatus::Mapped);
        record.external_email = Some(email.to_string());
        record.local_user_id = Some(local_id);
        record.last_refreshed = Some(RefreshStamp::At(Utc::now() - age));
        record
    }

    #[tokio::test]
    async fn test_stale_record_refreshed_when_source_agrees() {
        let source = Arc::new(ScriptedSource::new());
        source.script(
            "jane.smith",
            vec![Step::Found(identity("jane.smith@co.com"))],
        );
        let resolver = Arc::new(CountingResolver::new(&[]));
        let old = mapped("jane.smith", "jane.smith@co.com", 42, ChronoDuration::hours(2));
        let old_stamp = old.refreshed_at().unwrap();
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            resolver.clone(),
            vec![old],
        );

        let record = cache.get_mapping("jane.smith", true).await.unwrap();
        assert_eq!(record.status, MappingStatus::Mapped);
        assert_eq!(record.local_user_id, Some(42));
        assert!(record.refreshed_at().unwrap() > old_stamp);
        assert!(record.meta_flag(meta::SOURCE_ACTIVE));
        assert_eq!(source.calls("jane.smith"), 1);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(metrics.staleness_count("expired"), 1);
        assert_eq!(metrics.refreshed_count(true), 1);
        assert_eq!(metrics.fallback_events(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_refresh_with_skip_removes_mapping() {
        let source = Arc::new(ScriptedSource::new());
        source.script(
            "bob.wilson",
            vec![Step::Fail(SourceError::Connection("reset by peer".into()))],
        );
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            Arc::new(NoopResolver),
            vec![mapped("bob.wilson", "bob@co.com", 7, ChronoDuration::days(3))],
        );

        assert_eq!(cache.get_mapping("bob.wilson", true).await, None);
        assert!(cache.store.get("bob.wilson").await.is_none());
        // max_retries = 1 means two attempts
        assert_eq!(source.calls("bob.wilson"), 2);
        assert_eq!(metrics.refreshed_count(false), 1);
        assert_eq!(metrics.fallback_count("skip", "refresh_exhausted"), 1);
        assert_eq!(metrics.fallback_events(), 1);
    }

    #[tokio::test]
    async fn test_fresh_hits_do_no_lookups() {
        let source = Arc::new(ScriptedSource::new());
        source.script("alice", vec![Step::Found(identity("alice@co.com"))]);
        let (cache, _) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            Arc::new(CountingResolver::new(&[("alice@co.com", 5)])),
            vec![],
        );

        // Missing: one lookup, then fresh
        let first = cache.get_mapping("alice", true).await.unwrap();
        assert_eq!(first.local_user_id, Some(5));
        let second = cache.get_mapping("alice", true).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(source.calls("alice"), 1);
    }

    #[tokio::test]
    async fn test_stale_without_auto_refresh_is_served_as_is() {
        let source = Arc::new(ScriptedSource::new());
        let old = mapped("erin", "erin@co.com", 3, ChronoDuration::hours(5));
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            Arc::new(NoopResolver),
            vec![old.clone()],
        );

        assert_eq!(cache.get_mapping("erin", false).await, Some(old));
        assert_eq!(cache.get_mapping("nobody", false).await, None);
        assert_eq!(source.total_calls(), 0);
        assert_eq!(metrics.staleness_count("expired"), 1);
        assert_eq!(metrics.staleness_count("missing"), 1);
    }

    #[tokio::test]
    async fn test_email_drift_assigns_admin() {
        let source = Arc::new(ScriptedSource::new());
        source.script(
            "jane.smith",
            vec![Step::Found(identity("jane.smith@other.com"))],
        );
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::AssignAdmin {
                admin_id: Some(999),
            }),
            source,
            Arc::new(NoopResolver),
            vec![mapped(
                "jane.smith",
                "jane.smith@co.com",
                42,
                ChronoDuration::hours(2),
            )],
        );

        let outcome = cache.refresh("jane.smith").await;
        assert!(!outcome.is_success());
        let record = outcome.into_record().unwrap();
        assert_eq!(record.status, MappingStatus::FallbackAdmin);
        assert_eq!(record.local_user_id, Some(999));
        assert_eq!(record.fallback_user_id, Some(999));
        assert!(record.meta_flag(meta::NEEDS_REVIEW));
        assert_eq!(metrics.fallback_count("assign_admin", "email_mismatch"), 1);
    }

    #[tokio::test]
    async fn test_recovered_admin_fallback_is_resolved_again() {
        let source = Arc::new(ScriptedSource::new());
        source.script("gil", vec![Step::Found(identity("gil@co.com"))]);
        let mut previous = mapped("gil", "gil@co.com", 999, ChronoDuration::days(2));
        previous.status = MappingStatus::FallbackAdmin;
        previous.fallback_user_id = Some(999);
        previous.set_meta(meta::NEEDS_REVIEW, true);
        let (cache, _) = cache_with(
            config(FallbackStrategy::Skip),
            source,
            Arc::new(CountingResolver::new(&[("gil@co.com", 12)])),
            vec![previous],
        );

        let record = cache.get_mapping("gil", true).await.unwrap();
        assert_eq!(record.status, MappingStatus::Mapped);
        assert_eq!(record.local_user_id, Some(12));
        assert_eq!(record.fallback_user_id, None);
        assert!(!record.meta_flag(meta::NEEDS_REVIEW));
    }

    #[tokio::test]
    async fn test_resolver_error_leaves_unmapped_and_redacted() {
        let source = Arc::new(ScriptedSource::new());
        source.script("carol", vec![Step::Found(identity("carol@co.com"))]);
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::Skip),
            source,
            Arc::new(CountingResolver::failing()),
            vec![],
        );

        let record = cache.get_mapping("carol", true).await.unwrap();
        assert_eq!(record.status, MappingStatus::Unmapped);
        assert_eq!(record.local_user_id, None);
        let error = record.metadata[meta::RESOLVE_ERROR].as_str().unwrap();
        assert!(!error.contains("letmein"));
        assert_eq!(metrics.refreshed_count(true), 1);
        assert_eq!(metrics.fallback_events(), 0);
    }

    #[tokio::test]
    async fn test_batch_respects_concurrency_bound() {
        let source = Arc::new(ScriptedSource::new().with_latency(Duration::from_millis(20)));
        let names: Vec<String> = (0..10).map(|i| format!("user{i}")).collect();
        for name in &names {
            source.script(name, vec![Step::Found(identity(&format!("{name}@co.com")))]);
        }
        let mut config = config(FallbackStrategy::Skip);
        config.max_concurrent_refreshes = 2;
        let (cache, _) = cache_with(
            config,
            source.clone(),
            Arc::new(CountingResolver::new(&[("user0@co.com", 100)])),
            vec![],
        );

        let report = cache.batch_refresh(Some(names), None, None).await;
        assert_eq!(report.examined, 10);
        assert_eq!(report.stale, 10);
        assert_eq!(report.attempted, 10);
        assert_eq!(report.succeeded, 10);
        assert_eq!(report.reasons.get("missing"), Some(&10));
        assert!(source.peak_in_flight() <= 2);
        assert_eq!(cache.len().await, 10);

        let status_of = |username: &str| {
            report
                .per_item
                .iter()
                .find(|item| item.username == username)
                .and_then(|item| item.status)
        };
        assert_eq!(status_of("user0"), Some(MappingStatus::Mapped));
        assert_eq!(status_of("user1"), Some(MappingStatus::Unmapped));
    }

    #[tokio::test]
    async fn test_batch_distinguishes_nothing_stale_from_all_failed() {
        let source = Arc::new(ScriptedSource::new());
        let fresh = ["a", "b", "c"]
            .iter()
            .map(|name| mapped(name, &format!("{name}@co.com"), 1, ChronoDuration::minutes(5)))
            .collect();
        let (cache, _) = cache_with(
            config(FallbackStrategy::CreatePlaceholder),
            source.clone(),
            Arc::new(NoopResolver),
            fresh,
        );

        let report = cache.batch_refresh(None, None, None).await;
        assert_eq!(report.examined, 3);
        assert_eq!(report.stale, 0);
        assert_eq!(report.attempted, 0);
        assert_eq!(report.reasons.get("fresh"), Some(&3));
        assert_eq!(source.total_calls(), 0);

        // Unscripted users are not found in the source
        let report = cache
            .batch_refresh(Some(vec!["x".into(), "y".into(), "x".into()]), Some(0), None)
            .await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.stale, 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 2);
        for item in &report.per_item {
            assert_eq!(item.status, Some(MappingStatus::Placeholder));
            assert_eq!(item.fallback_reason, Some("user_not_found"));
        }
    }

    #[tokio::test]
    async fn test_batch_limit_and_retry_override() {
        let source = Arc::new(ScriptedSource::new());
        for name in ["a", "b", "c", "d"] {
            source.script(name, vec![Step::Fail(SourceError::Timeout)]);
        }
        let (cache, _) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            Arc::new(NoopResolver),
            vec![],
        );

        let report = cache
            .batch_refresh(
                Some(vec!["a".into(), "b".into(), "c".into(), "d".into()]),
                Some(2),
                Some(2),
            )
            .await;
        assert_eq!(report.stale, 4);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 2);
        // Two retries per item: three attempts each
        assert_eq!(source.total_calls(), 6);
        assert_eq!(source.calls("c"), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let source = Arc::new(ScriptedSource::new());
        source.script("dan", vec![Step::Found(identity("dan@co.com"))]);
        let mut config = config(FallbackStrategy::Skip);
        config.snapshot_path = Some(blocker.join("mappings.json"));
        let (cache, metrics) = cache_with(config, source, Arc::new(NoopResolver), vec![]);

        let record = cache.get_mapping("dan", true).await;
        assert!(record.is_some());
        assert_eq!(metrics.persist_failures_total.get() as u64, 1);
        assert!(cache.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_open_reloads_persisted_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(FallbackStrategy::Skip);
        config.snapshot_path = Some(dir.path().join("mappings.json"));

        let source = Arc::new(ScriptedSource::new());
        source.script("frank", vec![Step::Found(identity("frank@co.com"))]);
        let (cache, _) = cache_with(
            config.clone(),
            source.clone(),
            Arc::new(NoopResolver),
            vec![],
        );
        let written = cache.get_mapping("frank", true).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let reopened =
            IdentityCache::open(config, source.clone(), Arc::new(NoopResolver), metrics).await;
        assert_eq!(reopened.snapshot().await, vec![written.clone()]);

        // Loaded record is fresh, so no new lookup
        assert_eq!(reopened.get_mapping("frank", true).await, Some(written));
        assert_eq!(source.calls("frank"), 1);

        let report = reopened.staleness_report(Utc::now()).await;
        assert_eq!(report.get(&StaleReason::Fresh), Some(&1));
    }

    #[tokio::test]
    async fn test_drift_is_detected_again_on_next_refresh() {
        let source = Arc::new(ScriptedSource::new());
        source.script(
            "jane.smith",
            vec![Step::Found(identity("jane.smith@other.com"))],
        );
        let resolver = Arc::new(CountingResolver::new(&[("jane.smith@other.com", 5555)]));
        let (cache, metrics) = cache_with(
            config(FallbackStrategy::AssignAdmin {
                admin_id: Some(999),
            }),
            source.clone(),
            resolver.clone(),
            vec![mapped(
                "jane.smith",
                "jane.smith@co.com",
                42,
                ChronoDuration::hours(2),
            )],
        );

        for _ in 0..2 {
            let outcome = cache.refresh("jane.smith").await;
            assert!(!outcome.is_success());
            let record = outcome.into_record().unwrap();
            assert_eq!(record.status, MappingStatus::FallbackAdmin);
            assert_eq!(record.local_user_id, Some(999));
            assert!(record.meta_flag(meta::NEEDS_REVIEW));
            assert_eq!(record.external_email.as_deref(), Some("jane.smith@co.com"));
            assert_eq!(record.metadata[meta::FETCHED_EMAIL], "jane.smith@other.com");
        }
        assert_eq!(source.calls("jane.smith"), 2);
        assert_eq!(resolver.calls(), 0);
        assert_eq!(metrics.fallback_count("assign_admin", "email_mismatch"), 2);
        assert_eq!(metrics.refreshed_count(true), 0);
    }

    #[tokio::test]
    async fn test_batch_retry_override_clamped_to_ceiling() {
        let source = Arc::new(ScriptedSource::new());
        source.script("flaky", vec![Step::Fail(SourceError::Timeout)]);
        let (cache, _) = cache_with(
            config(FallbackStrategy::Skip),
            source.clone(),
            Arc::new(NoopResolver),
            vec![],
        );

        let report = cache
            .batch_refresh(Some(vec!["flaky".into()]), Some(50), None)
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.per_item[0].fallback_reason,
            Some("refresh_exhausted")
        );
        assert_eq!(source.calls("flaky"), MAX_RETRIES_CEILING as usize + 1);
    }

    #[tokio::test]
    async fn test_open_keeps_good_records_when_one_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");
        let mut table = serde_json::Map::new();
        for i in 0..50 {
            let name = format!("user{i}");
            table.insert(
                name.clone(),
                serde_json::to_value(mapped(
                    &name,
                    &format!("{name}@co.com"),
                    i,
                    ChronoDuration::minutes(1),
                ))
                .unwrap(),
            );
        }
        table.insert(
            "epoch".into(),
            serde_json::json!({"status": "mapped", "last_refreshed": 1700000000}),
        );
        table.insert("broken".into(), serde_json::json!({"status": 17}));
        std::fs::write(&path, serde_json::to_vec(&table).unwrap()).unwrap();

        let mut config = config(FallbackStrategy::Skip);
        config.snapshot_path = Some(path.clone());
        let source = Arc::new(ScriptedSource::new());
        source.script("newbie", vec![Step::Found(identity("newbie@co.com"))]);
        let cache = IdentityCache::open(
            config,
            source,
            Arc::new(NoopResolver),
            Arc::new(Metrics::new().unwrap()),
        )
        .await;
        assert_eq!(cache.len().await, 51);
        let report = cache.staleness_report(Utc::now()).await;
        assert_eq!(report.get(&StaleReason::InvalidTimestamp), Some(&1));

        assert!(cache.get_mapping("newbie", true).await.is_some());

        let saved: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved.len(), 52);
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .path()
                    .to_string_lossy()
                    .ends_with(".corrupt")
            })
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_closed_cache_leaves_records_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(FallbackStrategy::Skip);
        config.snapshot_path = Some(dir.path().join("mappings.json"));
        let source = Arc::new(ScriptedSource::new());
        let old = mapped("hal", "hal@co.com", 9, ChronoDuration::days(2));
        let (cache, metrics) = cache_with(
            config,
            source.clone(),
            Arc::new(NoopResolver),
            vec![old.clone()],
        );

        cache.shutdown().await.unwrap();
        assert!(dir.path().join("mappings.json").exists());

        assert_eq!(cache.get_mapping("hal", true).await, Some(old.clone()));
        assert_eq!(cache.refresh("hal").await, RefreshOutcome::Deferred(Some(old)));
        let report = cache.batch_refresh(None, None, None).await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.per_item[0].status, Some(MappingStatus::Mapped));
        assert_eq!(source.total_calls(), 0);
        assert_eq!(metrics.fallback_events(), 0);
    }
}
