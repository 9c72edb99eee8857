//! The immutable description of a single memory access, shared by every
//! packet that carries it through the hierarchy.

use std::cell::Cell;

use crate::{Address, MasterId, ThreadId, Tick};

/// Attributes of an access that do not change as it is retried, split, or
/// coalesced on its way through the hierarchy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessFlags {
    /// Bypasses the cache entirely; never allocates, never hits.
    pub uncacheable: bool,
    /// Part of a load-linked/store-conditional or lock-prefixed RMW pair.
    pub locked: bool,
    /// Software or hardware prefetch; misses are not on the CPU's critical path.
    pub prefetch: bool,
    /// Instruction fetch rather than a data access.
    pub instruction: bool,
}

/// A single logical memory access issued by a CPU.
///
/// `Request` is created once by the issuing CPU and then shared, never
/// copied, by every [`crate::packet::Packet`] that represents it or a
/// response to it: the original request packet, any packets it is coalesced
/// with, and the eventual response all point at the same `Request`.
#[derive(Debug)]
pub struct Request {
    pub vaddr: Address,
    pub paddr: Cell<Option<Address>>,
    pub size: u32,
    pub flags: AccessFlags,
    pub pc: Address,
    pub thread_id: ThreadId,
    pub master_id: MasterId,
    pub issue_tick: Tick,
    locked_rmw: Cell<bool>,
}

impl Request {
    pub fn new(
        vaddr: Address,
        size: u32,
        flags: AccessFlags,
        pc: Address,
        thread_id: ThreadId,
        master_id: MasterId,
        issue_tick: Tick,
    ) -> Self {
        Self {
            vaddr,
            paddr: Cell::new(None),
            size,
            flags,
            pc,
            thread_id,
            master_id,
            issue_tick,
            locked_rmw: Cell::new(flags.locked),
        }
    }

    /// Records that this access resolved to `paddr`, once translation completes.
    pub fn set_paddr(&self, paddr: Address) {
        self.paddr.set(Some(paddr));
    }

    pub fn paddr(&self) -> Option<Address> {
        self.paddr.get()
    }

    /// Marks this request as the locked half of a read-modify-write, per the
    /// CPU-side dispatch rule that locked stores must be recorded on the
    /// request itself rather than on any one packet.
    pub fn mark_locked(&self) {
        self.locked_rmw.set(true);
    }

    pub fn is_locked(&self) -> bool {
        self.locked_rmw.get()
    }
}
