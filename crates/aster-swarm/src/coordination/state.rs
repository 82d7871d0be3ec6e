//! Versioned shared state with optimistic concurrency

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{CoordinationError, CoordinationResult};

/// One versioned entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedState {
    pub key: String,
    pub value: Map<String, Value>,
    /// Starts at 1 on creation; each successful write adds exactly one
    pub version: u64,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Internally synchronized key → [`SharedState`] table
#[derive(Default)]
pub struct StateStore {
    entries: RwLock<HashMap<String, SharedState>>,
    version_conflicts: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<SharedState> {
        self.entries.read().get(key).cloned()
    }

    /// Current version of `key`; 0 when absent
    pub fn version(&self, key: &str) -> u64 {
        self.entries.read().get(key).map(|s| s.version).unwrap_or(0)
    }

    /// Write `value` if `key` is still at `expected_version`
    ///
    /// A missing key is at version 0, so creation passes 0.
    pub fn set(
        &self,
        key: &str,
        value: Map<String, Value>,
        expected_version: u64,
        updated_by: &str,
    ) -> CoordinationResult<SharedState> {
        let mut entries = self.entries.write();
        let actual = entries.get(key).map(|s| s.version).unwrap_or(0);
        if actual != expected_version {
            self.version_conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(CoordinationError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let state = SharedState {
            key: key.to_string(),
            value,
            version: actual + 1,
            updated_by: updated_by.to_string(),
            updated_at: Utc::now(),
        };
        entries.insert(key.to_string(), state.clone());
        Ok(state)
    }

    pub fn delete(&self, key: &str) -> Option<SharedState> {
        self.entries.write().remove(key)
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn version_conflicts(&self) -> u64 {
        self.version_conflicts.load(Ordering::Relaxed)
    }
}
