//! Snapshot file for the mapping table.
//!
//! The file is a single JSON object keyed by external username. Writes go to
//! a temp file that is then renamed over the snapshot, under a save lock so
//! two flushes never interleave. Records are decoded one by one: a record
//! that cannot be decoded is skipped, and the file is copied aside before the
//! next save can drop it.

use crate::cache::record::{MappingRecord, RefreshStamp};
use crate::error::PersistenceError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A decoded snapshot.
#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub records: HashMap<String, MappingRecord>,
    /// Usernames whose records could not be decoded
    pub rejected: Vec<String>,
}

/// Load a snapshot, back-filling `last_refreshed` on legacy records with `now`.
pub async fn load_from_disk(
    path: &Path,
    now: DateTime<Utc>,
) -> Result<LoadedSnapshot, PersistenceError> {
    info!(path = %path.display(), "Loading mapping snapshot from disk");

    let bytes = fs::read(path).await?;
    debug!(bytes = bytes.len(), "Read snapshot file");

    let raw: HashMap<String, Value> = serde_json::from_slice(&bytes)?;

    let mut loaded = LoadedSnapshot::default();
    let mut backfilled = 0usize;
    for (username, value) in raw {
        let mut record: MappingRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(e) => {
                warn!(username = %username, error = %e, "Skipping undecodable snapshot record");
                loaded.rejected.push(username);
                continue;
            }
        };
        if record.external_username.is_empty() {
            record.external_username = username.clone();
        }
        if record.last_refreshed.is_none() {
            debug!(username = %username, "Back-filling last_refreshed on legacy record");
            record.last_refreshed = Some(RefreshStamp::At(now));
            backfilled += 1;
        }
        loaded.records.insert(username, record);
    }
    loaded.rejected.sort();

    info!(
        records = loaded.records.len(),
        backfilled = backfilled,
        rejected = loaded.rejected.len(),
        "Loaded mapping snapshot"
    );
    Ok(loaded)
}

/// Write a snapshot atomically: temp file, then rename.
pub async fn persist_to_disk(
    records: &HashMap<String, MappingRecord>,
    path: &Path,
) -> Result<(), PersistenceError> {
    // Sorted keys keep snapshots diffable
    let ordered: BTreeMap<&String, &MappingRecord> = records.iter().collect();
    let bytes = serde_json::to_vec_pretty(&ordered)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = sibling(path, "tmp");
    fs::write(&temp_path, &bytes).await?;
    fs::rename(&temp_path, path).await?;

    debug!(
        path = %path.display(),
        records = records.len(),
        bytes = bytes.len(),
        "Mapping snapshot persisted"
    );
    Ok(())
}

/// `path` with `suffix` appended to the full file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// A snapshot location plus the lock serialising saves to it.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; a missing file is an empty table.
    ///
    /// A file that does not decode is moved aside and the error returned. A
    /// file with some undecodable records is copied aside and the rest load.
    pub async fn load(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, MappingRecord>, PersistenceError> {
        if !fs::try_exists(&self.path).await? {
            info!(path = %self.path.display(), "No mapping snapshot yet, starting empty");
            return Ok(HashMap::new());
        }

        match load_from_disk(&self.path, now).await {
            Ok(loaded) => {
                if !loaded.rejected.is_empty() {
                    let backup = self.backup_path(now);
                    fs::copy(&self.path, &backup).await?;
                    warn!(
                        backup = %backup.display(),
                        rejected = ?loaded.rejected,
                        "Snapshot had undecodable records, original kept as backup"
                    );
                }
                Ok(loaded.records)
            }
            Err(PersistenceError::Json(e)) => {
                let backup = self.backup_path(now);
                fs::rename(&self.path, &backup).await?;
                warn!(
                    backup = %backup.display(),
                    error = %e,
                    "Snapshot is not valid JSON, moved aside"
                );
                Err(PersistenceError::Json(e))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(
        &self,
        records: &HashMap<String, MappingRecord>,
    ) -> Result<(), PersistenceError> {
        let _guard = self.save_lock.lock().await;
        persist_to_disk(records, &self.path).await
    }

    fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        sibling(
            &self.path,
            &format!("{}.corrupt", now.format("%Y%m%dT%H%M%S%.3f")),
        )
    }
}
