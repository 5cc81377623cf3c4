//! Block registry: tracks every block file's size, stale-byte count, and lock state, and
//! implements the allocator described by the block selection policy.

use rand::Rng;

use crate::config::BLOCK_EXTENSION;

/// Per-block bookkeeping. `bid` is the file name including the reserved extension.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub bid: String,
    pub size: u64,
    pub stale_bytes: u64,
    pub locked: bool,
}

impl BlockInfo {
    pub fn new(bid: String) -> Self {
        Self {
            bid,
            size: 0,
            stale_bytes: 0,
            locked: false,
        }
    }

    fn eligible_for(&self, max_block_size: u64) -> bool {
        !self.locked && self.size < max_block_size
    }
}

/// Generates an opaque, base-36-ish token for a new block's file name.
pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Ordered collection of [`BlockInfo`], plus the allocator's `last_used` cursor.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Vec<BlockInfo>,
    last_used: Option<usize>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            last_used: None,
        }
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BlockInfo> {
        self.blocks.iter_mut()
    }

    pub fn get(&self, bid: &str) -> Option<&BlockInfo> {
        self.blocks.iter().find(|b| b.bid == bid)
    }

    pub fn get_mut(&mut self, bid: &str) -> Option<&mut BlockInfo> {
        self.blocks.iter_mut().find(|b| b.bid == bid)
    }

    pub fn contains(&self, bid: &str) -> bool {
        self.get(bid).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Inserts an already-known block (used during recovery, where the file already exists).
    pub fn insert_existing(&mut self, block: BlockInfo) {
        self.blocks.push(block);
    }

    /// Chooses (and, if necessary, creates) a destination block for the next append, returning
    /// its `bid`.
    ///
    /// Implements the three-step allocation policy: reuse `last_used` if it still qualifies,
    /// otherwise scan forward for the first qualifying block, otherwise synthesize a new one.
    /// `max_block_size` is a soft cap; a record that would overflow the chosen block is still
    /// written there. Returns whether the block was freshly created, so the caller can create
    /// the backing file.
    pub fn get_free_block(&mut self, max_block_size: u64) -> (String, bool) {
        if let Some(idx) = self.last_used {
            if idx < self.blocks.len() && self.blocks[idx].eligible_for(max_block_size) {
                return (self.blocks[idx].bid.clone(), false);
            }
        }

        let start = self.last_used.map(|i| i + 1).unwrap_or(0);
        for idx in start..self.blocks.len() {
            if self.blocks[idx].eligible_for(max_block_size) {
                self.last_used = Some(idx);
                return (self.blocks[idx].bid.clone(), false);
            }
        }

        let bid = format!("{}{}", generate_token(), BLOCK_EXTENSION);
        self.blocks.push(BlockInfo::new(bid.clone()));
        let idx = self.blocks.len() - 1;
        self.last_used = Some(idx);
        (bid, true)
    }

    /// Removes the block named `bid` from the registry, if present.
    pub fn remove(&mut self, bid: &str) -> Option<BlockInfo> {
        let idx = self.blocks.iter().position(|b| b.bid == bid)?;
        let removed = self.blocks.remove(idx);
        // Keep `last_used` pointing at a stable index; it's fine for it to become stale and
        // fail the range/eligibility check on next allocation, which falls through to the scan.
        if let Some(last) = self.last_used {
            if last >= self.blocks.len() {
                self.last_used = None;
            }
        }
        Some(removed)
    }

    /// Adds a brand-new block produced by compaction.
    pub fn insert_new(&mut self, block: BlockInfo) {
        self.blocks.push(block);
    }

    /// Returns the bids of every block whose stale bytes meet or exceed `threshold_bytes`, and
    /// which is not already locked.
    pub fn eligible_for_compaction(&self, threshold_bytes: u64) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| !b.locked && b.stale_bytes >= threshold_bytes)
            .map(|b| b.bid.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_last_used_block_when_eligible() {
        let mut registry = BlockRegistry::new();
        let (bid, _) = registry.get_free_block(1024);
        registry.get_mut(&bid).unwrap().size = 100;
        let (again, created) = registry.get_free_block(1024);
        assert_eq!(bid, again);
        assert!(!created);
    }

    #[test]
    fn scans_forward_when_last_used_is_full() {
        let mut registry = BlockRegistry::new();
        let (first, _) = registry.get_free_block(1024);
        registry.get_mut(&first).unwrap().size = 2048;
        let (second, created) = registry.get_free_block(1024);
        assert_ne!(first, second);
        assert!(created);
    }

    #[test]
    fn skips_locked_blocks() {
        let mut registry = BlockRegistry::new();
        let (first, _) = registry.get_free_block(1024);
        registry.get_mut(&first).unwrap().locked = true;
        let (second, _) = registry.get_free_block(1024);
        assert_ne!(first, second);
        assert!(!registry.get(&second).unwrap().locked);
    }

    #[test]
    fn never_selects_locked_or_full_block_property() {
        let mut registry = BlockRegistry::new();
        for i in 0..8 {
            let bid = format!("fixed-{i}{}", BLOCK_EXTENSION);
            let mut block = BlockInfo::new(bid);
            block.locked = i % 2 == 0;
            block.size = if i % 3 == 0 { 2048 } else { 0 };
            registry.insert_existing(block);
        }
        let (chosen, _) = registry.get_free_block(1024);
        let info = registry.get(&chosen).unwrap();
        assert!(!info.locked);
        assert!(info.size < 1024);
    }
}
