//! Cache geometry and mode configuration: a plain struct with a sane
//! `Default` and small derived accessor methods, validated once at
//! construction rather than checked on every access.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::Address;

/// Which coherence protocol a cache runs, selecting the
/// [`crate::coherence::CoherenceDriver`] it is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoherenceKind {
    /// Single cache, no peers to snoop; `allow_fast_writes` is always true.
    None,
    /// Modified/Shared/Invalid.
    Msi,
}

/// The transport mode a request is issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Fully pipelined, asynchronous completion via responses/retries.
    Timing,
    /// Synchronous completion returning a tick count; state still updates.
    Atomic,
    /// Synchronous completion that never consumes a tick and never mutates
    /// coherence state: debugger/checkpoint inspection.
    Functional,
}

/// Static geometry of a set-associative cache, fixed for the cache's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    pub block_size: u32,
    pub assoc: usize,
    pub n_sets: usize,
    pub mshr_capacity: usize,
    pub writeback_capacity: usize,
    pub hit_latency: u64,
    pub response_latency: u64,
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            block_size: 64,
            assoc: 4,
            n_sets: 64,
            mshr_capacity: 8,
            writeback_capacity: 8,
            hit_latency: 2,
            response_latency: 2,
        }
    }
}

impl CacheGeometry {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.block_size.is_power_of_two() {
            return Err(ConfigError::BlockSizeNotPowerOfTwo(self.block_size));
        }
        if !self.n_sets.is_power_of_two() {
            return Err(ConfigError::SetsNotPowerOfTwo(self.n_sets));
        }
        if self.assoc == 0 {
            return Err(ConfigError::ZeroAssociativity);
        }
        if self.mshr_capacity == 0 {
            return Err(ConfigError::ZeroMshrCapacity);
        }
        if self.writeback_capacity == 0 {
            return Err(ConfigError::ZeroWritebackCapacity);
        }
        Ok(())
    }

    pub fn block_size_log2(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    pub fn block_addr(&self, addr: Address) -> Address {
        addr & !((self.block_size as u64) - 1)
    }

    pub fn set_index(&self, addr: Address) -> usize {
        ((addr >> self.block_size_log2()) as usize) & (self.n_sets - 1)
    }

    pub fn tag(&self, addr: Address) -> Address {
        addr >> (self.block_size_log2() + self.n_sets.trailing_zeros())
    }

    pub fn total_bytes(&self) -> usize {
        self.block_size as usize * self.assoc * self.n_sets
    }
}
