//! File-backed identity store
//!
//! One JSON document on disk holds every seat record, keyed the same way
//! as the in-memory store (`race_{raceId}_participant`). The whole
//! document is rewritten on each save, the way the config layer treats
//! its file. Missing or corrupt documents read as empty rather than
//! failing the mount.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::error::StoreError;
use crate::core::identity::{record_key, SelfRecord};
use crate::core::io::IdentityStore;

/// [`IdentityStore`] persisted as a JSON document.
pub struct FileIdentityStore {
    path: PathBuf,
    records: HashMap<String, SelfRecord>,
}

impl FileIdentityStore {
    /// Open (or create) the store at `path`. A corrupt document is
    /// logged and treated as empty; the next save replaces it.
    pub fn open(path: &Path) -> Self {
        let records = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(records) => records,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "[STORE] Corrupt identity document, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "[STORE] No identity document yet");
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            records,
        }
    }

    fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self, race_id: &str) -> Option<SelfRecord> {
        self.records.get(&record_key(race_id)).cloned()
    }

    fn save(&mut self, record: &SelfRecord) -> Result<(), StoreError> {
        self.records
            .insert(record_key(&record.race_id), record.clone());
        self.persist()
    }

    fn clear(&mut self, race_id: &str) -> Result<(), StoreError> {
        if self.records.remove(&record_key(race_id)).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}
