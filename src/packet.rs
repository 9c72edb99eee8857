//! Packets: the single-owner units of work that flow between ports.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::request::Request;
use crate::{Address, Tick};

/// The operation a packet carries, spanning both CPU-facing requests and the
/// coherence-bus commands a cache issues on their behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    ReadReq,
    WriteReq,
    WritebackReq,
    UpgradeReq,
    InvalidateReq,
    WriteInvalidateReq,
    HardPfReq,
    ReadResp,
    WriteResp,
}

impl Command {
    pub fn is_request(self) -> bool {
        !matches!(self, Command::ReadResp | Command::WriteResp)
    }

    pub fn is_response(self) -> bool {
        !self.is_request()
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            Command::WriteReq | Command::WritebackReq | Command::WriteInvalidateReq
        )
    }

    pub fn is_read(self) -> bool {
        matches!(self, Command::ReadReq | Command::HardPfReq)
    }

    /// The response command expected for a request command, if any travels
    /// back to the requester (writebacks and bus-only commands do not).
    pub fn response(self) -> Option<Command> {
        match self {
            Command::ReadReq | Command::HardPfReq => Some(Command::ReadResp),
            Command::WriteReq => Some(Command::WriteResp),
            _ => None,
        }
    }
}

/// Flags set as a packet travels the hierarchy, distinct from the
/// [`crate::request::AccessFlags`] that describe the access itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// The request has been fully serviced; set on the response leg.
    pub satisfied: bool,
    /// A snooper reported the addressed line was present but stale/absent downstream.
    pub nacked_line: bool,
    /// A snoop response reported another cache holds the line too.
    pub shared_line: bool,
    /// A snoop has committed to supplying data; later snoopers must not also reply.
    pub snoop_commit: bool,
    /// This packet carries a whole cache line destined to fill a block.
    pub cache_line_fill: bool,
    /// Suppresses normal fill-on-miss allocation (e.g. streaming/no-allocate hints).
    pub no_allocate: bool,
}

/// Disposition of a packet once a transport call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketResult {
    /// Still travelling; no verdict yet (used for in-flight bookkeeping only).
    Pending,
    Success,
    BadAddress,
    /// Rejected by a full queue or busy resource; the *transport*, not the
    /// cache, is responsible for retrying.
    Nacked,
}

/// The payload a packet carries, if any.
#[derive(Debug, Clone)]
pub enum PacketData {
    None,
    /// Bytes owned by this packet alone (a response, or a victim's data).
    Owned(Vec<u8>),
}

impl PacketData {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            PacketData::None => None,
            PacketData::Owned(bytes) => Some(bytes),
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PacketData::None => None,
            PacketData::Owned(bytes) => Some(bytes),
        }
    }
}

/// A typed reference to the MSHR that owns an in-flight packet, replacing the
/// raw `senderState` pointer some simulators use.
pub type MshrHandle = Address;

/// A single-owner unit of work travelling between [`crate::port`] endpoints.
///
/// Exactly one component holds a `Packet` at any time; handing it to a peer
/// via `send_timing` moves ownership with it. There is no shared or aliased
/// packet state.
#[derive(Debug, Clone)]
pub struct Packet {
    pub request: Rc<Request>,
    pub command: Command,
    pub address: Address,
    pub size: u32,
    pub data: PacketData,
    pub flags: PacketFlags,
    pub result: PacketResult,
    /// The block address of the MSHR tracking this packet, if any.
    pub sender_state: Option<MshrHandle>,
    pub time: Tick,
}

impl Packet {
    pub fn new(request: Rc<Request>, command: Command, address: Address, size: u32, time: Tick) -> Self {
        Self {
            request,
            command,
            address,
            size,
            data: PacketData::None,
            flags: PacketFlags::default(),
            result: PacketResult::Pending,
            sender_state: None,
            time,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = PacketData::Owned(data);
        self
    }

    pub fn is_read(&self) -> bool {
        self.command.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.command.is_write()
    }

    pub fn is_request(&self) -> bool {
        self.command.is_request()
    }

    pub fn needs_response(&self) -> bool {
        self.command.response().is_some()
    }

    /// Whether this packet, arriving as a mem-side response, carries a whole
    /// line of data that should be installed into the tag store. Set on the
    /// bus request itself and carried through by whatever answers it, so a
    /// permission-only upgrade completion (no data transferred) can opt out.
    pub fn is_cache_fill(&self) -> bool {
        self.flags.cache_line_fill
    }

    /// Builds the response packet for a satisfied request, sharing the same
    /// `Request` and address/size but carrying its own freshly allocated data.
    pub fn make_response(&self, time: Tick) -> Option<Packet> {
        let response_cmd = self.command.response()?;
        let mut resp = Packet::new(Rc::clone(&self.request), response_cmd, self.address, self.size, time);
        resp.flags.satisfied = true;
        Some(resp)
    }
}
