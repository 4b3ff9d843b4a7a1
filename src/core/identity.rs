//! Durable self identity
//!
//! A participant's seat in a race survives reloads through one durable
//! record per race id. The record is read once at mount, written once on
//! join-ack, and cleared on leave or kick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::StoreError;
use crate::core::io::IdentityStore;

/// The locally persisted seat record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfRecord {
    pub race_id: String,
    pub participant_id: String,
    pub name: String,
}

/// Storage key for a race's seat record.
///
/// # Examples
///
/// ```
/// use keysprint_engine::core::identity::record_key;
///
/// assert_eq!(record_key("race-42"), "race_race-42_participant");
/// ```
pub fn record_key(race_id: &str) -> String {
    format!("race_{race_id}_participant")
}

/// Load the seat record for `race_id`, treating a record that names a
/// different race as "no identity yet" rather than an error.
pub fn current_record<S: IdentityStore>(store: &S, race_id: &str) -> Option<SelfRecord> {
    store.load(race_id).filter(|record| record.race_id == race_id)
}

/// In-memory store for tests and ephemeral embeddings.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: HashMap<String, SelfRecord>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record under an arbitrary key, bypassing the key scheme.
    /// Lets tests model leftover records from other races.
    pub fn seed(&mut self, key: &str, record: SelfRecord) {
        self.records.insert(key.to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, race_id: &str) -> Option<SelfRecord> {
        self.records.get(&record_key(race_id)).cloned()
    }

    fn save(&mut self, record: &SelfRecord) -> Result<(), StoreError> {
        self.records
            .insert(record_key(&record.race_id), record.clone());
        Ok(())
    }

    fn clear(&mut self, race_id: &str) -> Result<(), StoreError> {
        self.records.remove(&record_key(race_id));
        Ok(())
    }
}
