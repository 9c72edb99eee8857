//! Set-associative tag array: block lookup, allocation, and eviction,
//! independent of coherence and miss handling.

use crate::block::{BlockStatus, CacheBlk};
use crate::config::CacheGeometry;
use crate::mshr::WritebackEntry;
use crate::{Address, MasterId, Tick};

/// Chooses which way of a set to evict on a miss. Kept as a trait so
/// replacement can be swapped (random, LRU, ...) without touching the tag
/// store's bookkeeping.
pub trait ReplacementPolicy: std::fmt::Debug {
    fn choose_victim(&self, set: &[CacheBlk]) -> usize;
}

/// Evicts the way with the oldest `last_ref_tick`, invalid ways first.
#[derive(Debug, Default)]
pub struct Lru;

impl ReplacementPolicy for Lru {
    fn choose_victim(&self, set: &[CacheBlk]) -> usize {
        if let Some((way, _)) = set.iter().enumerate().find(|(_, blk)| !blk.is_valid()) {
            return way;
        }
        set.iter()
            .enumerate()
            .min_by_key(|(_, blk)| blk.last_ref_tick)
            .map(|(way, _)| way)
            .expect("a cache set always has at least one way")
    }
}

/// Location of a block within the tag store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlkRef {
    pub set_index: usize,
    pub way_index: usize,
}

/// Result of a lookup/allocation pass over the tag array.
#[derive(Debug)]
pub struct AccessStatus {
    pub blk: Option<BlkRef>,
    /// Writebacks produced by evicting a dirty victim to make room for a fill.
    pub writebacks: Vec<WritebackEntry>,
}

/// A set-associative array of cache lines plus victim selection.
#[derive(Debug)]
pub struct TagStore {
    geometry: CacheGeometry,
    sets: Vec<Vec<CacheBlk>>,
    replacement: Box<dyn ReplacementPolicy>,
}

impl TagStore {
    pub fn new(geometry: CacheGeometry, replacement: Box<dyn ReplacementPolicy>) -> Self {
        let sets = (0..geometry.n_sets)
            .map(|set_index| {
                (0..geometry.assoc)
                    .map(|way_index| CacheBlk::empty(set_index, way_index, geometry.block_size))
                    .collect()
            })
            .collect();
        Self {
            geometry,
            sets,
            replacement,
        }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn block_addr(&self, addr: Address) -> Address {
        self.geometry.block_addr(addr)
    }

    /// Pure lookup: does `addr` currently hit, with no side effects.
    pub fn lookup(&self, addr: Address) -> Option<BlkRef> {
        let block = self.block_addr(addr);
        let set_index = self.geometry.set_index(addr);
        self.sets[set_index]
            .iter()
            .find(|blk| blk.is_valid() && blk.block_addr == block)
            .map(|blk| BlkRef {
                set_index,
                way_index: blk.way_index,
            })
    }

    pub fn get(&self, blk: BlkRef) -> &CacheBlk {
        &self.sets[blk.set_index][blk.way_index]
    }

    pub fn get_mut(&mut self, blk: BlkRef) -> &mut CacheBlk {
        &mut self.sets[blk.set_index][blk.way_index]
    }

    /// Looks up `addr`, touching the block's recency on hit.
    pub fn handle_access(&mut self, addr: Address, now: Tick) -> AccessStatus {
        match self.lookup(addr) {
            Some(blk_ref) => {
                self.get_mut(blk_ref).touch(now);
                AccessStatus {
                    blk: Some(blk_ref),
                    writebacks: Vec::new(),
                }
            }
            None => AccessStatus {
                blk: None,
                writebacks: Vec::new(),
            },
        }
    }

    /// Chooses a victim for `addr`'s set, evicting it (producing a writeback
    /// if dirty) and installing `data`/`status` in its place.
    pub fn handle_fill(
        &mut self,
        addr: Address,
        data: Vec<u8>,
        status: BlockStatus,
        now: Tick,
        src_master_id: MasterId,
    ) -> AccessStatus {
        let set_index = self.geometry.set_index(addr);
        let block = self.block_addr(addr);
        let way_index = self.replacement.choose_victim(&self.sets[set_index]);
        let mut writebacks = Vec::new();
        {
            let victim = &self.sets[set_index][way_index];
            if victim.is_dirty() {
                writebacks.push(WritebackEntry::new(victim.block_addr, victim.data.clone(), now));
            }
        }
        let blk = &mut self.sets[set_index][way_index];
        blk.fill(block, data, status, now, src_master_id);
        AccessStatus {
            blk: Some(BlkRef { set_index, way_index }),
            writebacks,
        }
    }

    /// Applies a coherence-driven status change to an already-resident block
    /// (e.g. demoting Modified to Shared after a snoop read).
    pub fn handle_snoop(&mut self, blk: BlkRef, status: BlockStatus) {
        self.get_mut(blk).status = status;
    }

    pub fn invalidate(&mut self, addr: Address) {
        if let Some(blk) = self.lookup(addr) {
            self.get_mut(blk).invalidate();
        }
    }

    /// Every resident line in storage order, for checkpointing.
    pub fn blocks(&self) -> impl Iterator<Item = &CacheBlk> + '_ {
        self.sets.iter().flatten()
    }
}
