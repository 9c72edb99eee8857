//! Prefetch hinting: an optional side channel that turns cache accesses into
//! extra `HardPfReq` packets, never consulted for correctness.

use crate::{Address, Tick};

pub trait Prefetcher: std::fmt::Debug {
    /// Called on every demand access; returns addresses worth prefetching.
    fn notify_access(&mut self, block_addr: Address, now: Tick) -> Vec<Address>;
}

#[derive(Debug, Default)]
pub struct NullPrefetcher;

impl Prefetcher for NullPrefetcher {
    fn notify_access(&mut self, _block_addr: Address, _now: Tick) -> Vec<Address> {
        Vec::new()
    }
}

/// Always fetches the line immediately following the one just accessed.
#[derive(Debug)]
pub struct NextLinePrefetcher {
    pub block_size: u32,
}

impl Prefetcher for NextLinePrefetcher {
    fn notify_access(&mut self, block_addr: Address, _now: Tick) -> Vec<Address> {
        vec![block_addr + self.block_size as u64]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_line_prefetcher_targets_the_following_block() {
        let mut pf = NextLinePrefetcher { block_size: 64 };
        assert_eq!(pf.notify_access(0x1000, 0), vec![0x1040]);
    }
}
