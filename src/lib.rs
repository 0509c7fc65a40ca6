//! Staleness-aware identity mapping cache.
//!
//! Maps usernames in an external source system to local user ids, refreshing
//! mappings that have outlived their TTL under a bounded number of concurrent
//! lookups.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod services;
