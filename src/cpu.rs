//! The timing CPU model: a single-issue, in-order fetch/execute state
//! machine that talks to instruction and data caches purely through
//! [`crate::port::RequestPort`]s.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::packet::{Command, Packet, PacketData};
use crate::port::{RequestPort, RequestPortOwner, ResponsePortOwner};
use crate::request::{AccessFlags, Request};
use crate::scheduler::EventQueue;
use crate::translation::Translation;
use crate::{Address, MasterId, ThreadId, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    Idle,
    Running,
    IcacheRetry,
    IcacheWaitResponse,
    DcacheRetry,
    DcacheWaitResponse,
    Draining,
    SwitchedOut,
}

pub struct TimingCpu {
    pub name: String,
    pub thread_id: ThreadId,
    pub master_id: MasterId,
    pub pc: Address,
    state: CpuState,
    translation: Box<dyn Translation>,
    pub icache_port: RequestPort,
    pub dcache_port: RequestPort,
    pending_ifetch: Option<Packet>,
    pending_dreq: Option<Packet>,
    drain_requested: bool,
    scheduler: Rc<RefCell<dyn EventQueue>>,
}

impl TimingCpu {
    pub fn new(
        name: impl Into<String>,
        thread_id: ThreadId,
        master_id: MasterId,
        pc: Address,
        translation: Box<dyn Translation>,
        scheduler: Rc<RefCell<dyn EventQueue>>,
    ) -> Self {
        let name = name.into();
        Self {
            icache_port: RequestPort::new(format!("{name}.icache_port")),
            dcache_port: RequestPort::new(format!("{name}.dcache_port")),
            name,
            thread_id,
            master_id,
            pc,
            state: CpuState::Idle,
            translation,
            pending_ifetch: None,
            pending_dreq: None,
            drain_requested: false,
            scheduler,
        }
    }

    pub fn state(&self) -> CpuState {
        self.state
    }

    /// Issues an instruction fetch for the current `pc`. Translation faults
    /// are returned to the caller rather than panicking: they are a
    /// simulated outcome, not an implementation error.
    pub fn fetch(&mut self, now: Tick) -> Result<(), Fault> {
        assert_eq!(self.state, CpuState::Running, "fetch() called outside the Running state");
        let paddr = self.translation.translate(self.pc)?;
        let req = Rc::new(Request::new(
            self.pc,
            4,
            AccessFlags {
                instruction: true,
                ..Default::default()
            },
            self.pc,
            self.thread_id,
            self.master_id,
            now,
        ));
        req.set_paddr(paddr);
        let pkt = Packet::new(req, Command::ReadReq, paddr, 4, now);
        match self.icache_port.send_timing(pkt, now) {
            Ok(()) => self.state = CpuState::IcacheWaitResponse,
            Err(pkt) => {
                debug!("{}: icache request for pc={:#x} blocked, will retry", self.name, self.pc);
                self.pending_ifetch = Some(pkt);
                self.state = CpuState::IcacheRetry;
            }
        }
        Ok(())
    }

    pub fn complete_ifetch(&mut self, _pkt: Packet, now: Tick) {
        assert_eq!(self.state, CpuState::IcacheWaitResponse, "unexpected ifetch completion");
        self.pc += 4;
        self.state = CpuState::Running;
        self.maybe_drain(now);
    }

    pub fn retry_icache(&mut self, now: Tick) {
        if self.state != CpuState::IcacheRetry {
            return;
        }
        let pkt = self.pending_ifetch.take().expect("IcacheRetry state always holds a pending fetch");
        match self.icache_port.send_timing(pkt, now) {
            Ok(()) => self.state = CpuState::IcacheWaitResponse,
            Err(pkt) => self.pending_ifetch = Some(pkt),
        }
    }

    /// Issues a data access. `locked` marks the locked half of a
    /// read-modify-write pair, recorded on the `Request` per the CPU-side
    /// dispatch rule rather than on any one packet.
    pub fn issue_data_access(
        &mut self,
        vaddr: Address,
        size: u32,
        is_write: bool,
        data: Option<Vec<u8>>,
        locked: bool,
        now: Tick,
    ) -> Result<(), Fault> {
        assert_eq!(self.state, CpuState::Running, "issue_data_access() called outside the Running state");
        let paddr = self.translation.translate(vaddr)?;
        let req = Rc::new(Request::new(vaddr, size, AccessFlags::default(), self.pc, self.thread_id, self.master_id, now));
        req.set_paddr(paddr);
        if locked {
            req.mark_locked();
        }
        let command = if is_write { Command::WriteReq } else { Command::ReadReq };
        let mut pkt = Packet::new(req, command, paddr, size, now);
        if let Some(bytes) = data {
            pkt.data = PacketData::Owned(bytes);
        }
        match self.dcache_port.send_timing(pkt, now) {
            Ok(()) => self.state = CpuState::DcacheWaitResponse,
            Err(pkt) => {
                debug!("{}: dcache request for {:#x} blocked, will retry", self.name, vaddr);
                self.pending_dreq = Some(pkt);
                self.state = CpuState::DcacheRetry;
            }
        }
        Ok(())
    }

    pub fn complete_data_access(&mut self, _pkt: Packet, now: Tick) {
        assert_eq!(self.state, CpuState::DcacheWaitResponse, "unexpected data access completion");
        self.state = CpuState::Running;
        self.maybe_drain(now);
    }

    pub fn retry_dcache(&mut self, now: Tick) {
        if self.state != CpuState::DcacheRetry {
            return;
        }
        let pkt = self.pending_dreq.take().expect("DcacheRetry state always holds a pending access");
        match self.dcache_port.send_timing(pkt, now) {
            Ok(()) => self.state = CpuState::DcacheWaitResponse,
            Err(pkt) => self.pending_dreq = Some(pkt),
        }
    }

    pub fn start(&mut self) {
        assert_eq!(self.state, CpuState::Idle, "start() called on an already-running CPU");
        self.state = CpuState::Running;
    }

    /// Requests the CPU suspend at the next safe point (no outstanding
    /// cache access), per the Draining suspension model.
    pub fn request_drain(&mut self) {
        self.drain_requested = true;
        if self.state == CpuState::Running {
            self.state = CpuState::Draining;
            self.state = CpuState::SwitchedOut;
        }
    }

    fn maybe_drain(&mut self, _now: Tick) {
        if self.drain_requested {
            self.state = CpuState::Draining;
            self.state = CpuState::SwitchedOut;
        }
    }
}

impl std::fmt::Debug for TimingCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingCpu")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("pc", &self.pc)
            .finish()
    }
}

/// Shim routing icache responses/retries to the CPU that owns this port,
/// since one `TimingCpu` has two independent ports (`icache`, `dcache`) but
/// `RequestPortOwner` carries no port identity of its own.
#[derive(Debug)]
pub struct IcacheEndpoint(pub Rc<RefCell<TimingCpu>>);

impl RequestPortOwner for IcacheEndpoint {
    fn recv_timing_resp(&mut self, pkt: Packet, now: Tick) -> bool {
        self.0.borrow_mut().complete_ifetch(pkt, now);
        true
    }

    fn recv_retry_req(&mut self, now: Tick) {
        self.0.borrow_mut().retry_icache(now);
    }
}

#[derive(Debug)]
pub struct DcacheEndpoint(pub Rc<RefCell<TimingCpu>>);

impl RequestPortOwner for DcacheEndpoint {
    fn recv_timing_resp(&mut self, pkt: Packet, now: Tick) -> bool {
        self.0.borrow_mut().complete_data_access(pkt, now);
        true
    }

    fn recv_retry_req(&mut self, now: Tick) {
        self.0.borrow_mut().retry_dcache(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DeterministicQueue;
    use crate::translation::IdentityTranslation;

    #[derive(Debug, Default)]
    struct AlwaysAccept {
        last: Option<Packet>,
    }
    impl ResponsePortOwner for AlwaysAccept {
        fn recv_timing_req(&mut self, pkt: Packet, _now: Tick) -> Result<(), Packet> {
            self.last = Some(pkt);
            Ok(())
        }
        fn recv_atomic_req(&mut self, _pkt: &mut Packet, _now: Tick) -> Tick {
            0
        }
        fn recv_functional_req(&mut self, _pkt: &mut Packet) {}
        fn recv_retry_resp(&mut self, _now: Tick) {}
    }

    fn cpu() -> TimingCpu {
        let scheduler = Rc::new(RefCell::new(DeterministicQueue::new()));
        let mut c = TimingCpu::new("cpu0", 0, 0, 0x1000, Box::new(IdentityTranslation), scheduler);
        c.start();
        c
    }

    #[test]
    fn fetch_advances_to_icache_wait_response() {
        let mut c = cpu();
        c.icache_port.connect(Rc::new(RefCell::new(AlwaysAccept::default())));
        c.fetch(0).unwrap();
        assert_eq!(c.state(), CpuState::IcacheWaitResponse);
    }

    #[test]
    fn completing_the_ifetch_advances_pc_and_returns_to_running() {
        let mut c = cpu();
        c.icache_port.connect(Rc::new(RefCell::new(AlwaysAccept::default())));
        c.fetch(0).unwrap();
        let pc_before = c.pc;
        let req = Rc::new(Request::new(pc_before, 4, AccessFlags::default(), pc_before, 0, 0, 0));
        let resp = Packet::new(req, Command::ReadResp, pc_before, 4, 1);
        c.complete_ifetch(resp, 1);
        assert_eq!(c.state(), CpuState::Running);
        assert_eq!(c.pc, pc_before + 4);
    }

    #[test]
    fn locked_store_marks_the_request() {
        let mut c = cpu();
        c.dcache_port.connect(Rc::new(RefCell::new(AlwaysAccept::default())));
        c.issue_data_access(0x2000, 4, true, Some(vec![1, 2, 3, 4]), true, 0).unwrap();
        assert_eq!(c.state(), CpuState::DcacheWaitResponse);
    }
}
