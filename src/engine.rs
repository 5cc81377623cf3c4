//! Engine facade.
//!
//! Coordinates sequence/rid allocation, block selection, the storage backend, and the dual
//! index, and owns the recovery protocol and background compaction/flush sweeps.
//!
//! ## Concurrency
//!
//! `EngineState` (the registry, both index maps, `seq_no`, `rid_no`) lives behind a
//! [`parking_lot::Mutex`] and is only ever touched synchronously: every `set`/`delete` brackets
//! its index/registry mutation inside a single lock acquisition that performs no `.await`, so the
//! critical section can never be suspended mid-mutation. The durability append itself happens
//! after the lock is released. Background flush and compaction sweeps are separate tokio tasks
//! spawned at `open` and aborted at `close`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::block::{generate_token, BlockInfo, BlockRegistry};
use crate::codec::{self, Envelope, Oid, RecordId};
use crate::config::{EngineConfig, BLOCK_EXTENSION};
use crate::error::{CodecError, EngineError, StorageError};
use crate::index::{Index, MapEntry};
use crate::storage::Storage;

struct EngineState {
    registry: BlockRegistry,
    index: Index,
    seq_no: u64,
    rid_no: u64,
}

/// The open, running storage engine for one directory.
pub struct Engine {
    config: EngineConfig,
    storage: Storage,
    state: Mutex<EngineState>,
    is_open: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Intermediate recovery record: the winning line observed for one id, across every block.
struct RecoveredLine {
    bid: String,
    oid: Oid,
    rid: u64,
    seq: u64,
    raw: String,
}

impl Engine {
    /// Opens an engine on `config.dir_path()`, running the full recovery protocol, and arms the
    /// background flush/compaction timers.
    pub async fn open(config: EngineConfig) -> Result<Arc<Engine>, EngineError> {
        let storage = Storage::new(config.dir_path().to_path_buf());
        storage
            .ensure_dir()
            .await
            .map_err(|source| EngineError::Io { source })?;

        let on_disk = storage
            .list_blocks(BLOCK_EXTENSION)
            .await
            .map_err(|source| EngineError::Io { source })?;

        let mut registry = BlockRegistry::new();
        let mut winners: HashMap<RecordId, RecoveredLine> = HashMap::new();
        let mut seq_no = 0u64;

        for (bid, size) in &on_disk {
            registry.insert_existing(BlockInfo {
                bid: bid.clone(),
                size: *size,
                stale_bytes: 0,
                locked: false,
            });

            let mut stream = storage.read_block(bid);
            let mut line_no = 0u64;
            while let Some(item) = stream.next().await {
                line_no += 1;
                let (line, _) = item.map_err(|source| EngineError::Io { source })?;
                let parsed = match codec::parse_line(bid, line_no, &line) {
                    Ok(p) => p,
                    Err(e @ CodecError::EmptyLine { .. }) => {
                        return Err(EngineError::EmptyLine { source: e })
                    }
                    Err(e) => return Err(EngineError::InvalidRecord { source: e }),
                };

                seq_no = seq_no.max(parsed.seq);

                let should_replace = match winners.get(&parsed.id) {
                    Some(existing) => !(existing.seq > parsed.seq),
                    None => true,
                };
                if should_replace {
                    winners.insert(
                        parsed.id,
                        RecoveredLine {
                            bid: bid.clone(),
                            oid: parsed.oid,
                            rid: parsed.rid,
                            seq: parsed.seq,
                            raw: parsed.raw,
                        },
                    );
                }
            }

            debug!(bid = %bid, size, "recovered block");
        }

        let mut index = Index::new();
        let mut rid_no = 0u64;
        for (id, line) in winners {
            if line.oid != Oid::Set {
                // Tombstones (and reserved operation tags) are not retained in the live index;
                // only their `_seq` contribution, already folded into `seq_no` above, survives.
                continue;
            }
            rid_no = rid_no.max(line.rid);
            let cache = codec::project_cache(&line.raw, &config.cached_fields);
            index.insert(
                id.clone(),
                MapEntry {
                    id,
                    rid: line.rid,
                    seq: line.seq,
                    bid: line.bid,
                    record: line.raw,
                    cache,
                },
            );
        }

        if registry.is_empty() {
            let (bid, _created) = registry.get_free_block(config.max_block_size());
            storage
                .create_block(&bid)
                .await
                .map_err(|source| EngineError::Io { source })?;
        }

        recompute_stale_bytes(&mut registry, &index);

        let live_count = index.len();
        info!(
            blocks = on_disk.len(),
            live_keys = live_count,
            seq_no,
            rid_no,
            "engine recovered"
        );

        let engine = Arc::new(Engine {
            config,
            storage,
            state: Mutex::new(EngineState {
                registry,
                index,
                seq_no,
                rid_no,
            }),
            is_open: AtomicBool::new(true),
            background: Mutex::new(Vec::new()),
        });

        Engine::spawn_background_tasks(&engine);

        Ok(engine)
    }

    /// Cancels background timers, flushes every open handle, and marks the engine unusable.
    /// Idempotent: a second call observes the engine already closed and is a no-op.
    pub async fn close(&self) -> Result<(), EngineError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            handle.abort();
        }

        self.storage
            .close()
            .await
            .map_err(|source| EngineError::Io { source })?;

        info!("engine closed");
        Ok(())
    }

    /// Returns `true` iff `id` is present in the live index.
    pub fn has(&self, id: impl Into<RecordId>) -> Result<bool, EngineError> {
        self.ensure_open()?;
        let id = self.validate_id(id.into())?;
        let state = self.state.lock();
        Ok(state.index.contains(&id))
    }

    /// Returns the live record for `id`, if present, deserialized as `T`.
    pub fn get<T: DeserializeOwned>(
        &self,
        id: impl Into<RecordId>,
    ) -> Result<Option<Envelope<T>>, EngineError> {
        self.ensure_open()?;
        let id = self.validate_id(id.into())?;
        let state = self.state.lock();
        let Some(entry) = state.index.get(&id) else {
            return Ok(None);
        };

        let envelope: Envelope<T> =
            serde_json::from_str(&entry.record).map_err(|e| EngineError::InvalidRecord {
                source: CodecError::InvalidRecord {
                    bid: entry.bid.clone(),
                    line_no: 0,
                    cause: format!("failed to deserialize stored record: {e}"),
                },
            })?;

        if envelope.id != id {
            return Err(EngineError::InternalCorruption {
                reason: format!(
                    "stored record id {} does not match requested id {}",
                    envelope.id, id
                ),
            });
        }

        Ok(Some(envelope))
    }

    /// Writes `value` under `id`, overlaying reserved metadata, and returns the written record.
    pub async fn set<T: Serialize>(
        &self,
        id: impl Into<RecordId>,
        value: T,
    ) -> Result<Envelope<T>, EngineError> {
        self.ensure_open()?;
        let id = self.validate_id(id.into())?;

        let (seq, rid, bid, line) = {
            let mut state = self.state.lock();

            let existing_rid = state.index.rid_of(&id);
            state.seq_no += 1;
            let seq = state.seq_no;
            let rid = match existing_rid {
                Some(r) => r,
                None => {
                    state.rid_no += 1;
                    state.rid_no
                }
            };

            let line = codec::encode_set(&id, seq, rid, &value)
                .map_err(|source| EngineError::InvalidRecord { source })?;

            let (bid, created) = state.registry.get_free_block(self.config.max_block_size());
            let cache = codec::project_cache(&line, &self.config.cached_fields);

            let entry = MapEntry {
                id: id.clone(),
                rid,
                seq,
                bid: bid.clone(),
                record: line.clone(),
                cache,
            };
            let displaced = state.index.insert(id.clone(), entry);

            if let Some(prev) = &displaced {
                if let Some(block) = state.registry.get_mut(&prev.bid) {
                    block.stale_bytes += codec::line_disk_size(&prev.record);
                }
            }
            if let Some(block) = state.registry.get_mut(&bid) {
                block.size += codec::line_disk_size(&line);
            }

            if created {
                debug!(bid = %bid, "allocated new block");
            }

            (seq, rid, bid, line)
        };

        if let Err(e) = self
            .storage
            .append_to_block(&bid, &line, self.config.sync_every_write)
            .await
        {
            self.handle_storage_error(e);
        }

        debug!(id = %id, seq, rid, bid = %bid, "set");

        Ok(Envelope::new(id, Oid::Set, rid, seq, value))
    }

    /// Removes `id`, if present. A no-op, returning `Ok(())`, if the key is absent.
    pub async fn delete(&self, id: impl Into<RecordId>) -> Result<(), EngineError> {
        self.ensure_open()?;
        let id = self.validate_id(id.into())?;

        let outcome = {
            let mut state = self.state.lock();
            let Some(existing) = state.index.get(&id).cloned() else {
                return Ok(());
            };

            state.seq_no += 1;
            let seq = state.seq_no;
            let rid = existing.rid;

            let line = codec::encode_delete(&id, seq, rid)
                .map_err(|source| EngineError::InvalidRecord { source })?;

            let (bid, _created) = state.registry.get_free_block(self.config.max_block_size());
            let displaced = state.index.remove(&id);

            if let Some(prev) = &displaced {
                if let Some(block) = state.registry.get_mut(&prev.bid) {
                    block.stale_bytes += codec::line_disk_size(&prev.record);
                }
            }
            if let Some(block) = state.registry.get_mut(&bid) {
                block.size += codec::line_disk_size(&line);
                // The tombstone itself is garbage too; only its `_seq` matters, and only until
                // a later recovery observes it.
                block.stale_bytes += codec::line_disk_size(&line);
            }

            (seq, bid, line)
        };

        let (seq, bid, line) = outcome;
        if let Err(e) = self
            .storage
            .append_to_block(&bid, &line, self.config.sync_every_write)
            .await
        {
            self.handle_storage_error(e);
        }

        debug!(id = %id, seq, bid = %bid, "delete");
        Ok(())
    }

    /// Forces an immediate compaction sweep, bypassing the `compact_delay` timer.
    pub async fn compact_now(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.run_compaction_sweep().await;
        Ok(())
    }

    pub fn dir_path(&self) -> &std::path::Path {
        self.config.dir_path()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotOpen)
        }
    }

    fn validate_id(&self, id: RecordId) -> Result<RecordId, EngineError> {
        match &id {
            RecordId::String(s) if s.is_empty() => Err(EngineError::InvalidId),
            _ => Ok(id),
        }
    }

    fn handle_storage_error(&self, error: StorageError) {
        warn!(error = %error, "storage operation failed");
        if let Some(hook) = &self.config.on_error {
            hook(&error);
        }
    }

    fn spawn_background_tasks(engine: &Arc<Engine>) {
        let mut handles = Vec::new();

        if !engine.config.sync_every_write {
            let engine = Arc::clone(engine);
            let interval = engine.config.data_sync_delay.max(std::time::Duration::from_millis(1));
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Err(e) = engine.storage.flush_all().await {
                        engine.handle_storage_error(e);
                    }
                }
            }));
        }

        if !engine.config.compaction_disabled() {
            let engine = Arc::clone(engine);
            let interval = engine.config.compact_delay.max(std::time::Duration::from_millis(1));
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    engine.run_compaction_sweep().await;
                }
            }));
        }

        *engine.background.lock() = handles;
    }

    async fn run_compaction_sweep(&self) {
        let threshold = self.config.stale_threshold_bytes();
        let eligible = {
            let state = self.state.lock();
            state.registry.eligible_for_compaction(threshold)
        };
        if eligible.is_empty() {
            return;
        }
        debug!(count = eligible.len(), "compaction sweep found eligible blocks");
        for bid in eligible {
            if let Err(e) = self.compact_block(&bid).await {
                warn!(bid = %bid, error = %e, "compaction failed");
                self.handle_storage_error(e);
            }
        }
    }

    /// Rewrites block `bid`'s live content into a fresh block, then retires `bid` to
    /// `<bid>.old`. See the compaction algorithm: lock, rewrite, atomically re-point the index,
    /// evict stray survivors, retire the old file.
    #[tracing::instrument(skip(self))]
    async fn compact_block(&self, bid: &str) -> Result<(), StorageError> {
        {
            let mut state = self.state.lock();
            match state.registry.get_mut(bid) {
                Some(block) if !block.locked => block.locked = true,
                _ => return Ok(()),
            }
        }

        let new_bid = format!("{}{}", generate_token(), BLOCK_EXTENSION);
        let tmp_name = format!("{new_bid}.tmp");

        let to_rewrite: Vec<(RecordId, MapEntry)> = {
            let state = self.state.lock();
            state
                .index
                .iter()
                .filter(|(_, e)| e.bid == bid)
                .map(|(id, e)| (id.clone(), e.clone()))
                .collect()
        };

        let mut bytes_written = 0u64;
        for (_, entry) in &to_rewrite {
            self.storage
                .append_to_block(&tmp_name, &entry.record, false)
                .await?;
            bytes_written += codec::line_disk_size(&entry.record);
        }
        self.storage.flush_block(&tmp_name).await?;
        self.storage.rename_block(&tmp_name, &new_bid).await?;

        {
            let mut state = self.state.lock();
            for (id, mut entry) in to_rewrite {
                // Only re-point entries that are still, at this moment, the authoritative copy
                // for their key (same `_seq` we rewrote). A concurrent write with a higher
                // `_seq` already points elsewhere and must not be clobbered.
                let current_seq = state.index.get(&id).map(|e| e.seq);
                if current_seq == Some(entry.seq) {
                    entry.bid = new_bid.clone();
                    state.index.insert(id, entry);
                }
            }
            state.index.retain_not_in_block(bid);

            state.registry.remove(bid);
            let mut replacement = BlockInfo::new(new_bid.clone());
            replacement.size = bytes_written;
            state.registry.insert_new(replacement);
        }

        if let Err(e) = self
            .storage
            .rename_block(bid, &format!("{bid}.old"))
            .await
        {
            warn!(bid = %bid, error = %e, "failed to retire compacted block to .old residue");
        }

        info!(old_bid = %bid, new_bid = %new_bid, bytes_written, "compaction complete");
        Ok(())
    }
}

/// Recomputes every block's `staleBytes` from scratch by walking the live index.
fn recompute_stale_bytes(registry: &mut BlockRegistry, index: &Index) {
    let mut live_bytes: HashMap<String, u64> = HashMap::new();
    for (_, entry) in index.iter() {
        *live_bytes.entry(entry.bid.clone()).or_insert(0) += codec::line_disk_size(&entry.record);
    }
    for block in registry.blocks_mut() {
        let live = live_bytes.get(&block.bid).copied().unwrap_or(0);
        block.stale_bytes = block.size.saturating_sub(live);
    }
}
