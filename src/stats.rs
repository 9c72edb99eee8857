//! Cache statistics, kept behind `Arc<Mutex<_>>` even though this crate's
//! event loop is itself single-threaded: it lets a checkpoint or a parallel
//! test harness read stats without borrowing the cache mutably.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packet::Command;

/// Counters for one cache instance, indexed by the command that caused them
/// where that distinction matters (reads vs. writes hit and miss
/// differently).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: HashMap<Command, u64>,
    pub misses: HashMap<Command, u64>,
    pub reservation_failures: u64,
    pub fast_writes: u64,
    pub writebacks: u64,
    pub snoop_invalidations: u64,
    pub mshr_allocations: u64,
    pub mshr_coalesces: u64,
}

impl CacheStats {
    pub fn record_hit(&mut self, cmd: Command) {
        *self.hits.entry(cmd).or_insert(0) += 1;
    }

    pub fn record_miss(&mut self, cmd: Command) {
        *self.misses.entry(cmd).or_insert(0) += 1;
    }

    pub fn total_hits(&self) -> u64 {
        self.hits.values().sum()
    }

    pub fn total_misses(&self) -> u64 {
        self.misses.values().sum()
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = (self.total_hits(), self.total_misses());
        if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} hit_rate={:.3} reservation_failures={} fast_writes={} writebacks={}",
            self.total_hits(),
            self.total_misses(),
            self.hit_rate(),
            self.reservation_failures,
            self.fast_writes,
            self.writebacks
        )
    }
}
