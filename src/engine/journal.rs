//! Persisted, crash-recoverable index of cached image layers
//!
//! Maps a cache key (layer name) to the content digest it was built from.
//! The journal also carries the instance id used to namespace cache keys;
//! persisting it is what lets the layer cache survive a daemon restart.

use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    io::Read,
    sync::{Mutex, MutexGuard, PoisonError},
};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct JournalState {
    uuid: String,
    layers: HashMap<String, String>,
}

/// Safe for concurrent lookups and inserts from many spool calls; dumps
/// take a consistent snapshot under the same lock.
#[derive(Debug)]
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Journal {
    pub fn new() -> Self {
        Journal {
            state: Mutex::new(JournalState {
                uuid: Uuid::new_v4().to_string(),
                layers: HashMap::new(),
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the in-memory state with a previously dumped journal.
    pub fn load(&self, reader: impl Read) -> Result<(), serde_json::Error> {
        let loaded: JournalState = serde_json::from_reader(reader)?;
        *self.locked() = loaded;
        Ok(())
    }

    /// Forget the persisted instance id. Used in weak cache mode, where
    /// separate daemon instances must never share cache keys.
    pub fn reset_instance_id(&self) {
        self.locked().uuid = Uuid::new_v4().to_string();
    }

    pub fn instance_id(&self) -> String {
        self.locked().uuid.clone()
    }

    /// True when `key` is cached and was built from exactly `digest`.
    pub fn contains(&self, key: &str, digest: &str) -> bool {
        self.locked().layers.get(key).map(String::as_str) == Some(digest)
    }

    pub fn insert(&self, key: &str, digest: &str) {
        self.locked()
            .layers
            .insert(key.to_string(), digest.to_string());
    }

    /// Drop entries whose layer the backend no longer reports. Backend
    /// layers unknown to the journal are left alone. Returns the number
    /// of entries dropped.
    pub fn retain_backed(&self, live_layers: &[String]) -> usize {
        let live: HashSet<&str> = live_layers.iter().map(String::as_str).collect();
        let mut state = self.locked();
        let before = state.layers.len();
        state.layers.retain(|key, _| live.contains(key.as_str()));
        before - state.layers.len()
    }

    /// Serialize a consistent snapshot for persistence.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&*self.locked())
    }

    pub fn len(&self) -> usize {
        self.locked().layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Journal {
    fn default() -> Self {
        Journal::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_then_load_is_observationally_equal() {
        let journal = Journal::new();
        journal.insert("layer-a", "sha256:aaa");
        journal.insert("layer-b", "sha256:bbb");
        let dumped = journal.serialize().unwrap();

        let restored = Journal::new();
        restored.load(dumped.as_slice()).unwrap();
        assert_eq!(restored.instance_id(), journal.instance_id());
        assert!(restored.contains("layer-a", "sha256:aaa"));
        assert!(restored.contains("layer-b", "sha256:bbb"));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn contains_requires_matching_digest() {
        let journal = Journal::new();
        journal.insert("layer-a", "sha256:aaa");
        assert!(journal.contains("layer-a", "sha256:aaa"));
        assert!(!journal.contains("layer-a", "sha256:zzz"));
        assert!(!journal.contains("layer-b", "sha256:aaa"));
    }

    #[test]
    fn reconciliation_drops_unbacked_entries() {
        let journal = Journal::new();
        journal.insert("kept", "sha256:aaa");
        journal.insert("gone", "sha256:bbb");
        let dropped =
            journal.retain_backed(&["kept".to_string(), "unrelated".to_string()]);
        assert_eq!(dropped, 1);
        assert!(journal.contains("kept", "sha256:aaa"));
        assert!(!journal.contains("gone", "sha256:bbb"));
    }

    #[test]
    fn reset_changes_instance_id() {
        let journal = Journal::new();
        let before = journal.instance_id();
        journal.reset_instance_id();
        assert_ne!(journal.instance_id(), before);
    }
}
