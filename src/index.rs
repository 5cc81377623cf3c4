//! The primary (`id -> MapEntry`) and reverse (`_rid -> id`) index maps.
//!
//! Kept as two independent [`std::collections::HashMap`]s rather than a single map with a
//! secondary lookup structure, matching the "cyclic-free index" design note: entries are
//! conceptually shared between the two maps but are plain owned clones, so there is no aliasing
//! to reason about under update.

use std::collections::HashMap;

use serde_json::Map as JsonMap;
use serde_json::Value;

use crate::codec::RecordId;

/// Index value: the metadata plus the exact serialized line for one live key.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub id: RecordId,
    pub rid: u64,
    pub seq: u64,
    pub bid: String,
    /// The exact JSON text (no trailing newline) appended for this record.
    pub record: String,
    /// Optional projection of configured `cached_fields`, if any were configured.
    pub cache: Option<JsonMap<String, Value>>,
}

/// The dual-keyed live index: by user id, and by internal `_rid`.
#[derive(Debug, Default)]
pub struct Index {
    by_id: HashMap<RecordId, MapEntry>,
    by_rid: HashMap<u64, RecordId>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_rid: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &RecordId) -> Option<&MapEntry> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn rid_of(&self, id: &RecordId) -> Option<u64> {
        self.by_id.get(id).map(|e| e.rid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RecordId, &MapEntry)> {
        self.by_id.iter()
    }

    /// Installs `entry` as the live value for `id`, returning the entry it displaced, if any.
    /// Keeps `by_id` and `by_rid` consistent (I2): the old `_rid` mapping is removed before the
    /// new one is installed.
    pub fn insert(&mut self, id: RecordId, entry: MapEntry) -> Option<MapEntry> {
        let previous = self.by_id.remove(&id);
        if let Some(prev) = &previous {
            self.by_rid.remove(&prev.rid);
        }
        self.by_rid.insert(entry.rid, id.clone());
        self.by_id.insert(id, entry);
        previous
    }

    /// Removes `id` from both maps, returning the entry that was present, if any.
    pub fn remove(&mut self, id: &RecordId) -> Option<MapEntry> {
        let removed = self.by_id.remove(id)?;
        self.by_rid.remove(&removed.rid);
        Some(removed)
    }

    /// Removes every entry whose `bid` equals `bid`. Used by compaction to evict stray entries
    /// that were re-added under a different block id during the rewrite (step 5b).
    pub fn retain_not_in_block(&mut self, bid: &str) {
        let stale_ids: Vec<RecordId> = self
            .by_id
            .iter()
            .filter(|(_, e)| e.bid == bid)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_ids {
            self.remove(&id);
        }
    }
}
