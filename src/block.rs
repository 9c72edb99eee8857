//! Cache block state: the per-line metadata stored in the [`crate::tag_store`].

use serde::{Deserialize, Serialize};

use crate::{Address, MasterId, Tick};

/// Coherence/validity bits of a cache line, kept as one small set of booleans
/// rather than a pointer-chasing state object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub valid: bool,
    /// Line may be written without first acquiring ownership (Modified/Exclusive).
    pub writable: bool,
    pub dirty: bool,
    /// Line's data may be returned to a CPU read (false only mid-fill).
    pub readable: bool,
    pub prefetched: bool,
}

impl BlockStatus {
    pub const INVALID: BlockStatus = BlockStatus {
        valid: false,
        writable: false,
        dirty: false,
        readable: false,
        prefetched: false,
    };
}

/// One line of cached data plus its coherence/replacement metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBlk {
    /// Address of the first byte of the line (not merely the upper tag bits:
    /// the set index is implicit in storage position, so the full block
    /// address is kept here for direct comparison).
    pub block_addr: Address,
    pub set_index: usize,
    pub way_index: usize,
    pub status: BlockStatus,
    pub data: Vec<u8>,
    pub last_ref_tick: Tick,
    pub src_master_id: Option<MasterId>,
}

impl CacheBlk {
    pub fn empty(set_index: usize, way_index: usize, block_size: u32) -> Self {
        Self {
            block_addr: 0,
            set_index,
            way_index,
            status: BlockStatus::INVALID,
            data: vec![0u8; block_size as usize],
            last_ref_tick: 0,
            src_master_id: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status.valid
    }

    pub fn is_dirty(&self) -> bool {
        self.status.valid && self.status.dirty
    }

    pub fn is_writable(&self) -> bool {
        self.status.valid && self.status.writable
    }

    pub fn invalidate(&mut self) {
        self.status = BlockStatus::INVALID;
    }

    pub fn fill(&mut self, block_addr: Address, data: Vec<u8>, status: BlockStatus, now: Tick, src_master_id: MasterId) {
        self.block_addr = block_addr;
        self.data = data;
        self.status = status;
        self.last_ref_tick = now;
        self.src_master_id = Some(src_master_id);
    }

    pub fn touch(&mut self, now: Tick) {
        self.last_ref_tick = now;
    }
}
