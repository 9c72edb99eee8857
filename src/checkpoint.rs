//! Serializable snapshots of cache and CPU state, so a simulation run
//! can be saved and resumed exactly where it left off.

use serde::{Deserialize, Serialize};

use crate::block::CacheBlk;
use crate::config::CacheGeometry;
use crate::cpu::CpuState;
use crate::stats::CacheStats;
use crate::Tick;

/// A snapshot of one cache's resident state, gated on the controller being
/// quiescent (no outstanding MSHRs or writebacks): taking a checkpoint while
/// misses are in flight would lose them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCheckpoint {
    pub geometry: CacheGeometry,
    pub blocks: Vec<CacheBlk>,
    pub stats: CacheStats,
    pub tick: Tick,
}

/// A snapshot of the CPU's fetch/execute state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuCheckpoint {
    pub state: CpuState,
    pub pc: u64,
    pub tick: Tick,
}
