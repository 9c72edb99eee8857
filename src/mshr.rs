//! Miss Status Holding Register table and writeback buffer.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::packet::{Command, Packet};
use crate::{Address, Tick};

/// A dirty line evicted from the tag store, waiting to be written back to
/// the next level. Tracked separately from the miss table because it
/// competes for the same mem-side port but never blocks a CPU-visible
/// response.
#[derive(Debug, Clone)]
pub struct WritebackEntry {
    pub block_addr: Address,
    pub data: Vec<u8>,
    pub issue_tick: Tick,
    pub in_service: bool,
}

impl WritebackEntry {
    pub fn new(block_addr: Address, data: Vec<u8>, issue_tick: Tick) -> Self {
        Self {
            block_addr,
            data,
            issue_tick,
            in_service: false,
        }
    }
}

/// One outstanding miss, with every request coalesced onto the same line
/// queued as a target awaiting the fill.
#[derive(Debug)]
pub struct Mshr {
    pub block_addr: Address,
    pub size: u32,
    pub issue_tick: Tick,
    pub in_service: bool,
    /// The command the first target actually wanted (ReadReq/WriteReq/...).
    pub orig_cmd: Command,
    /// The command issued on the bus to service the miss, which may differ
    /// from `orig_cmd` (e.g. a write miss issuing a ReadReq for
    /// write-allocate).
    pub bus_cmd: Command,
    pub targets: VecDeque<Packet>,
    /// True once a coherence snoop has asked this outstanding line to be
    /// invalidated on arrival, deferred because the line is not resident yet.
    pub deferred_invalidate: bool,
}

impl Mshr {
    fn new(block_addr: Address, size: u32, orig_cmd: Command, bus_cmd: Command, issue_tick: Tick, first: Packet) -> Self {
        let mut targets = VecDeque::new();
        targets.push_back(first);
        Self {
            block_addr,
            size,
            issue_tick,
            in_service: false,
            orig_cmd,
            bus_cmd,
            targets,
            deferred_invalidate: false,
        }
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }
}

/// Tracks in-flight misses and pending writebacks with fixed capacity each,
/// so that a full table becomes visible backpressure (a `RESERVATION_FAIL`
/// equivalent handled by the caller) rather than unbounded growth.
#[derive(Debug)]
pub struct MshrTable {
    pub capacity: usize,
    pub writeback_capacity: usize,
    outstanding: IndexMap<Address, Mshr>,
    writebacks: IndexMap<Address, WritebackEntry>,
}

impl MshrTable {
    pub fn new(capacity: usize, writeback_capacity: usize) -> Self {
        Self {
            capacity,
            writeback_capacity,
            outstanding: IndexMap::new(),
            writebacks: IndexMap::new(),
        }
    }

    pub fn full(&self) -> bool {
        self.outstanding.len() >= self.capacity
    }

    pub fn writeback_full(&self) -> bool {
        self.writebacks.len() >= self.writeback_capacity
    }

    pub fn find_mshr(&self, block_addr: Address) -> Option<&Mshr> {
        self.outstanding.get(&block_addr)
    }

    pub fn find_mshr_mut(&mut self, block_addr: Address) -> Option<&mut Mshr> {
        self.outstanding.get_mut(&block_addr)
    }

    /// Allocates a new MSHR for `block_addr`, or coalesces `pkt` onto an
    /// existing one. Returns `true` if a new MSHR was allocated (the caller
    /// must issue a bus request), `false` if the packet was merged onto an
    /// in-flight miss. Panics if the table is full and no existing entry
    /// matches: the caller (`Cache::access`) must check `full()` first and
    /// turn that into a reservation failure before ever reaching here.
    pub fn handle_miss(&mut self, block_addr: Address, size: u32, orig_cmd: Command, bus_cmd: Command, pkt: Packet, now: Tick) -> bool {
        if let Some(mshr) = self.outstanding.get_mut(&block_addr) {
            mshr.targets.push_back(pkt);
            return false;
        }
        assert!(
            !self.full(),
            "MshrTable::handle_miss called on a full table; caller must check full() first"
        );
        let mshr = Mshr::new(block_addr, size, orig_cmd, bus_cmd, now, pkt);
        self.outstanding.insert(block_addr, mshr);
        true
    }

    /// Queues a dirty eviction for writeback. Returns `false` if the
    /// writeback buffer is full and the entry was not queued.
    pub fn do_writeback(&mut self, entry: WritebackEntry) -> bool {
        if self.writeback_full() {
            return false;
        }
        self.writebacks.insert(entry.block_addr, entry);
        true
    }

    pub fn find_writes(&self, block_addr: Address) -> Option<&WritebackEntry> {
        self.writebacks.get(&block_addr)
    }

    pub fn find_writes_mut(&mut self, block_addr: Address) -> Option<&mut WritebackEntry> {
        self.writebacks.get_mut(&block_addr)
    }

    pub fn mark_in_service(&mut self, block_addr: Address) {
        if let Some(mshr) = self.outstanding.get_mut(&block_addr) {
            mshr.in_service = true;
        }
    }

    /// Undoes a coherence-driven bus command rewrite (e.g. an Upgrade the
    /// protocol substituted for a plain read) after the send itself failed,
    /// so the next attempt re-derives `bus_cmd` from scratch rather than
    /// retrying a stale rewrite against possibly-changed resident state.
    /// Also drops `in_service`, since the bus never actually took ownership.
    pub fn restore_orig_cmd(&mut self, block_addr: Address) {
        if let Some(mshr) = self.outstanding.get_mut(&block_addr) {
            mshr.bus_cmd = mshr.orig_cmd;
            mshr.in_service = false;
        }
    }

    pub fn have_pending(&self) -> bool {
        !self.outstanding.is_empty() || !self.writebacks.is_empty()
    }

    /// Whether this table is currently trying to own the mem-side bus: an
    /// MSHR or writeback already marked in-service, awaiting its reply.
    pub fn do_master_request(&self) -> bool {
        self.outstanding.values().any(|m| m.in_service) || self.writebacks.values().any(|wb| wb.in_service)
    }

    /// Pops the next packet this table wants to issue on the mem-side port:
    /// an outstanding miss not yet in service takes priority over a queued
    /// writeback, so demand misses are never starved by background
    /// writebacks.
    pub fn next_to_issue(&self) -> Option<Address> {
        self.outstanding
            .iter()
            .find(|(_, m)| !m.in_service)
            .map(|(addr, _)| *addr)
            .or_else(|| {
                self.writebacks
                    .iter()
                    .find(|(_, wb)| !wb.in_service)
                    .map(|(addr, _)| *addr)
            })
    }

    /// Removes and returns a completed MSHR, along with its targets.
    pub fn retire(&mut self, block_addr: Address) -> Option<Mshr> {
        self.outstanding.shift_remove(&block_addr)
    }

    pub fn retire_writeback(&mut self, block_addr: Address) -> Option<WritebackEntry> {
        self.writebacks.shift_remove(&block_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AccessFlags, Request};
    use std::rc::Rc;

    fn pkt(addr: Address, cmd: Command) -> Packet {
        let req = Rc::new(Request::new(addr, 8, AccessFlags::default(), 0, 0, 0, 0));
        Packet::new(req, cmd, addr, 8, 0)
    }

    #[test]
    fn second_miss_to_same_line_coalesces() {
        let mut table = MshrTable::new(4, 4);
        let allocated = table.handle_miss(0x40, 64, Command::ReadReq, Command::ReadReq, pkt(0x40, Command::ReadReq), 0);
        assert!(allocated);
        let allocated = table.handle_miss(0x44, 64, Command::ReadReq, Command::ReadReq, pkt(0x44, Command::ReadReq), 1);
        assert!(!allocated, "second access to the same line must coalesce, not allocate");
        assert_eq!(table.find_mshr(0x40).unwrap().targets.len(), 2);
    }

    #[test]
    fn full_writeback_buffer_rejects_new_entries() {
        let mut table = MshrTable::new(4, 1);
        assert!(table.do_writeback(WritebackEntry::new(0x0, vec![0; 64], 0)));
        assert!(!table.do_writeback(WritebackEntry::new(0x40, vec![0; 64], 0)));
    }

    #[test]
    fn restore_orig_cmd_undoes_a_rewrite_and_clears_in_service() {
        let mut table = MshrTable::new(4, 4);
        table.handle_miss(0x40, 64, Command::WriteReq, Command::UpgradeReq, pkt(0x40, Command::WriteReq), 0);
        table.mark_in_service(0x40);
        assert!(table.do_master_request());
        table.restore_orig_cmd(0x40);
        let mshr = table.find_mshr(0x40).unwrap();
        assert_eq!(mshr.bus_cmd, Command::WriteReq);
        assert!(!mshr.in_service);
        assert!(!table.do_master_request());
    }

    #[test]
    fn find_writes_mut_allows_marking_a_writeback_in_service() {
        let mut table = MshrTable::new(4, 4);
        table.do_writeback(WritebackEntry::new(0x40, vec![0; 64], 0));
        table.find_writes_mut(0x40).unwrap().in_service = true;
        assert!(table.do_master_request());
        assert!(table.find_writes(0x40).unwrap().in_service);
    }
}
