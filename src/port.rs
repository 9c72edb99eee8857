//! Timing/atomic/functional transport between components.
//!
//! Each connection has exactly one `RequestPort` (owned by the requester,
//! e.g. a CPU or a cache's mem-side) wired to exactly one `ResponsePort`
//! (owned by the responder, e.g. a cache's cpu-side or a memory model).
//! Sending a packet moves ownership of it to the peer; a rejected
//! `send_timing` hands ownership straight back to the caller, which must
//! hold onto it until a retry notification arrives.

use std::cell::RefCell;
use std::rc::Rc;

use crate::packet::Packet;
use crate::Tick;

/// Implemented by whoever owns a `RequestPort`: receives responses to
/// requests it previously sent, and retry notifications after a blocked
/// send.
pub trait RequestPortOwner: std::fmt::Debug {
    fn recv_timing_resp(&mut self, pkt: Packet, now: Tick) -> bool;
    fn recv_retry_req(&mut self, now: Tick);
}

/// Implemented by whoever owns a `ResponsePort`: receives requests from a
/// peer `RequestPort`, in any transport mode, and retry notifications after
/// a blocked response send.
pub trait ResponsePortOwner: std::fmt::Debug {
    /// `Err(pkt)` hands the packet straight back to the sender, preserving
    /// single ownership: a rejected packet is never dropped, only
    /// returned to whoever is now responsible for retrying it.
    fn recv_timing_req(&mut self, pkt: Packet, now: Tick) -> Result<(), Packet>;
    fn recv_atomic_req(&mut self, pkt: &mut Packet, now: Tick) -> Tick;
    fn recv_functional_req(&mut self, pkt: &mut Packet);
    fn recv_retry_resp(&mut self, now: Tick);
}

/// The requesting end of a connection: sends requests downstream, receives
/// responses and retries back through its owner.
pub struct RequestPort {
    name: String,
    peer: Option<Rc<RefCell<dyn ResponsePortOwner>>>,
}

impl RequestPort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer: None,
        }
    }

    pub fn connect(&mut self, peer: Rc<RefCell<dyn ResponsePortOwner>>) {
        self.peer = Some(peer);
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    fn peer(&self) -> &Rc<RefCell<dyn ResponsePortOwner>> {
        self.peer
            .as_ref()
            .unwrap_or_else(|| panic!("port {} sent a request before being connected", self.name))
    }

    /// Attempts to send `pkt` downstream. On `Err`, the caller gets the
    /// packet back and must hold it until `recv_retry_req`.
    pub fn send_timing(&self, pkt: Packet, now: Tick) -> Result<(), Packet> {
        self.peer().borrow_mut().recv_timing_req(pkt, now)
    }

    pub fn send_atomic(&self, pkt: &mut Packet, now: Tick) -> Tick {
        self.peer().borrow_mut().recv_atomic_req(pkt, now)
    }

    pub fn send_functional(&self, pkt: &mut Packet) {
        self.peer().borrow_mut().recv_functional_req(pkt)
    }
}

impl std::fmt::Debug for RequestPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPort")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// The responding end of a connection: receives requests, sends responses
/// back upstream.
pub struct ResponsePort {
    name: String,
    peer: Option<Rc<RefCell<dyn RequestPortOwner>>>,
}

impl ResponsePort {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peer: None,
        }
    }

    pub fn connect(&mut self, peer: Rc<RefCell<dyn RequestPortOwner>>) {
        self.peer = Some(peer);
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    /// A clone of the peer handle, for scheduling a delayed send without
    /// needing a self-referential handle to the port's own owner.
    pub fn peer_handle(&self) -> Rc<RefCell<dyn RequestPortOwner>> {
        Rc::clone(self.peer())
    }

    fn peer(&self) -> &Rc<RefCell<dyn RequestPortOwner>> {
        self.peer
            .as_ref()
            .unwrap_or_else(|| panic!("port {} sent a response before being connected", self.name))
    }

    /// Attempts to send a response upstream. Returns `true` if accepted.
    pub fn send_timing(&self, pkt: Packet, now: Tick) -> bool {
        self.peer().borrow_mut().recv_timing_resp(pkt, now)
    }

    pub fn send_retry(&self, now: Tick) {
        self.peer().borrow_mut().recv_retry_req(now)
    }
}

impl std::fmt::Debug for ResponsePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponsePort")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}
