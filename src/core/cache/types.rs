//! Cache type definitions

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::core::entity::EntityKey;
use crate::core::store::Record;

/// One cache row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPath {
    pub key: EntityKey,
    /// Path relative to the project root, `/`-separated; empty for the root
    pub path: String,
}

impl CachedPath {
    /// Minimal `{type, id}` record for merging into a session
    pub fn key_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("type".into(), JsonValue::String(self.key.entity_type.clone()));
        record.insert("id".into(), JsonValue::from(self.key.id));
        record
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub by_type: BTreeMap<String, usize>,
    pub db_size_bytes: u64,
}

/// Result of re-indexing tag sidecars
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub dirs_scanned: usize,
    pub entries_indexed: usize,
    /// Entities tagged on more than one directory; the first path wins
    pub duplicates: usize,
    /// Sidecars that could not be read
    pub unreadable: usize,
    pub duration_ms: u64,
}
