//! Durable storage of endpoint records.
//!
//! The driver writes a record before an endpoint becomes visible and
//! removes it, best effort, when the endpoint is deleted. Records found
//! at startup are handed back to the driver for recovery.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::StoreError;

const ENDPOINT_DIR: &str = "endpoint";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Persisted form of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: String,
    pub network_id: String,
    pub mac: String,
    /// IPv4 address with prefix length
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_v6: Option<String>,
    pub src_name: String,
}

/// Persistence backend consumed by the driver
pub trait Store: Send + Sync {
    /// One-time setup, returning the records left by a previous run
    fn init_store(&self) -> Result<Vec<EndpointRecord>, StoreError>;

    fn save(&self, record: &EndpointRecord) -> Result<(), StoreError>;

    /// Remove a record; a record that was never saved is not an error
    fn delete(&self, record: &EndpointRecord) -> Result<(), StoreError>;
}

/// Store keeping one JSON file per endpoint below a state directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn endpoint_dir(&self) -> PathBuf {
        self.root.join(ENDPOINT_DIR)
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.contains('/') || id.starts_with('.') {
            return Err(StoreError::Backend(format!("invalid record key {:?}", id)));
        }
        Ok(self.endpoint_dir().join(format!("{}.json", id)))
    }
}

impl Store for FileStore {
    fn init_store(&self) -> Result<Vec<EndpointRecord>, StoreError> {
        let dir = self.endpoint_dir();
        fs::create_dir_all(&dir)?;

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice::<EndpointRecord>(&bytes).map_err(StoreError::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable endpoint record {}: {}", path.display(), e),
            }
        }

        debug!("Loaded {} endpoint records from {}", records.len(), dir.display());
        Ok(records)
    }

    fn save(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id)?;
        // one temp file per write, saves of the same id may race
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{}.tmp", std::process::id(), seq));
        let json = serde_json::to_vec_pretty(record)?;

        let written = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove temporary record {}: {}", tmp.display(), cleanup);
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, record: &EndpointRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Endpoint record {} was already gone", record.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> EndpointRecord {
        EndpointRecord {
            id: id.to_string(),
            network_id: "net1".to_string(),
            mac: "02:42:0a:00:00:05".to_string(),
            address: "10.0.0.5/24".to_string(),
            address_v6: None,
            src_name: format!("veth{}", id),
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.init_store().unwrap().is_empty());

        store.save(&record("ep1")).unwrap();
        store.save(&record("ep2")).unwrap();

        let reopened = FileStore::new(dir.path());
        let mut records = reopened.init_store().unwrap();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(records, vec![record("ep1"), record("ep2")]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init_store().unwrap();

        store.save(&record("ep1")).unwrap();
        store.delete(&record("ep1")).unwrap();
        store.delete(&record("ep1")).unwrap();
        store.delete(&record("never-saved")).unwrap();
        assert!(store.init_store().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init_store().unwrap();
        store.save(&record("ep1")).unwrap();
        fs::write(dir.path().join(ENDPOINT_DIR).join("bad.json"), b"{").unwrap();

        let records = store.init_store().unwrap();
        assert_eq!(records, vec![record("ep1")]);
    }

    #[test]
    fn test_failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init_store().unwrap();

        // a non-empty directory where the record should go makes the rename fail
        let endpoint_dir = dir.path().join(ENDPOINT_DIR);
        fs::create_dir(endpoint_dir.join("ep1.json")).unwrap();
        fs::write(endpoint_dir.join("ep1.json").join("keep"), b"x").unwrap();

        assert!(store.save(&record("ep1")).is_err());
        let leftovers: Vec<_> = fs::read_dir(&endpoint_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "left behind {:?}", leftovers);
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let store = FileStore::new("/nonexistent");
        assert!(store.save(&record("../escape")).is_err());
        assert!(store.save(&record("")).is_err());
    }
}
