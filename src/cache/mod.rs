//! Identity mapping cache.
//!
//! - Mapping store and record model
//! - Staleness classification
//! - Bounded, retrying source lookups
//! - Drift validation and fallback strategies
//! - Snapshot persistence

pub mod fallback;
pub mod fetcher;
pub mod identity_cache;
pub mod limiter;
pub mod persistence;
pub mod record;
pub mod redact;
pub mod staleness;
pub mod store;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use fallback::{FallbackReason, FallbackStrategy};
pub use fetcher::RetryPolicy;
pub use identity_cache::{BatchRefreshReport, IdentityCache, ItemResult, RefreshOutcome};
pub use persistence::{load_from_disk, persist_to_disk, LoadedSnapshot, SnapshotFile};
pub use record::{MappingRecord, MappingStatus, RefreshStamp};
pub use staleness::{classify, is_stale, StaleReason};
