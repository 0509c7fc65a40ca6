//! The mapping table. All access goes through [`MappingStore`], and its lock
//! is held only for the map operation itself.

use crate::cache::record::MappingRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct MappingStore {
    records: Arc<RwLock<HashMap<String, MappingRecord>>>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: HashMap<String, MappingRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    pub async fn get(&self, username: &str) -> Option<MappingRecord> {
        self.records.read().await.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.records.read().await.contains_key(username)
    }

    /// Write `record`, stamping it at `now`.
    ///
    /// The stamp is taken against whatever is stored at write time, so
    /// `last_refreshed` keeps increasing even when two refreshes of the same
    /// username race. Last writer wins.
    pub async fn put(&self, mut record: MappingRecord, now: DateTime<Utc>) -> MappingRecord {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&record.external_username) {
            if existing.refreshed_at() > record.refreshed_at() {
                record.last_refreshed = existing.last_refreshed.clone();
            }
        }
        record.touch(now);
        records.insert(record.external_username.clone(), record.clone());
        record
    }

    pub async fn remove(&self, username: &str) -> Option<MappingRecord> {
        self.records.write().await.remove(username)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Copy of the whole table.
    pub async fn snapshot(&self) -> HashMap<String, MappingRecord> {
        self.records.read().await.clone()
    }
}
