//! Pluggable coherence protocols. The cache controller asks its
//! `CoherenceDriver` what bus command to issue and how a block's status
//! should change on a hit/fill/snoop; it never encodes protocol rules
//! itself.

use crate::block::BlockStatus;
use crate::packet::{Command, Packet};

/// Per-line state under the MSI protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsiState {
    Modified,
    Shared,
    Invalid,
}

/// Outcome of handling an incoming bus request/snoop against resident state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnoopOutcome {
    /// The snoop response indicates this cache supplied or shares the line.
    pub supplied: bool,
    /// The resulting status for the snooped block, if it remains resident.
    pub new_status: Option<BlockStatus>,
}

/// A pluggable coherence protocol. The cache controller never encodes
/// protocol rules directly: it asks the driver what to do.
pub trait CoherenceDriver: std::fmt::Debug {
    /// The bus command to issue for a CPU-side request against `have_status`
    /// (the block's current status, or invalid status if it is a miss).
    fn bus_cmd(&self, cpu_cmd: Command, have_status: BlockStatus) -> Command;

    /// The status a block should carry once `pkt` (a fill or a successful
    /// upgrade) completes.
    fn next_state(&self, pkt: &Packet, old_status: BlockStatus) -> BlockStatus;

    /// Handles an incoming bus request/snoop against a (possibly absent)
    /// resident block.
    fn handle_bus_request(&self, pkt: &Packet, have_status: Option<BlockStatus>) -> SnoopOutcome;

    /// Propagates an invalidate for `pkt`'s address upstream of this cache,
    /// ahead of any local snoop handling. `is_timing` distinguishes a timing
    /// snoop from an atomic one. Neither driver here has an upstream cache to
    /// notify; a multi-level hierarchy would override this to forward the
    /// invalidate onward.
    fn propagate_invalidate(&self, _pkt: &Packet, _is_timing: bool) {}

    /// Whether a store may complete immediately without first acquiring
    /// exclusive ownership, because there are no peers to invalidate.
    fn allow_fast_writes(&self) -> bool;

    /// Whether this driver actually enforces coherence among peers, or is a
    /// no-op for a cache with none.
    fn has_protocol(&self) -> bool;
}

/// No peers to snoop: every access is trivially coherent with itself.
#[derive(Debug, Default)]
pub struct NullCoherence;

impl CoherenceDriver for NullCoherence {
    fn bus_cmd(&self, cpu_cmd: Command, _have_status: BlockStatus) -> Command {
        match cpu_cmd {
            Command::WriteReq => Command::ReadReq,
            other => other,
        }
    }

    fn next_state(&self, pkt: &Packet, _old_status: BlockStatus) -> BlockStatus {
        BlockStatus {
            valid: true,
            writable: true,
            dirty: pkt.is_write(),
            readable: true,
            prefetched: pkt.command == Command::HardPfReq,
        }
    }

    fn handle_bus_request(&self, _pkt: &Packet, have_status: Option<BlockStatus>) -> SnoopOutcome {
        SnoopOutcome {
            supplied: false,
            new_status: have_status,
        }
    }

    fn allow_fast_writes(&self) -> bool {
        true
    }

    fn has_protocol(&self) -> bool {
        false
    }
}

/// Modified/Shared/Invalid, the minimal protocol able to exercise a
/// snoop-while-missing interaction between two caches.
#[derive(Debug, Default)]
pub struct MsiCoherence;

impl MsiCoherence {
    fn status_of(state: MsiState) -> BlockStatus {
        match state {
            MsiState::Modified => BlockStatus {
                valid: true,
                writable: true,
                dirty: true,
                readable: true,
                prefetched: false,
            },
            MsiState::Shared => BlockStatus {
                valid: true,
                writable: false,
                dirty: false,
                readable: true,
                prefetched: false,
            },
            MsiState::Invalid => BlockStatus::INVALID,
        }
    }
}

impl CoherenceDriver for MsiCoherence {
    fn bus_cmd(&self, cpu_cmd: Command, have_status: BlockStatus) -> Command {
        match cpu_cmd {
            Command::ReadReq | Command::HardPfReq => Command::ReadReq,
            Command::WriteReq if have_status.valid && !have_status.writable => Command::UpgradeReq,
            Command::WriteReq => Command::ReadReq,
            other => other,
        }
    }

    fn next_state(&self, pkt: &Packet, _old_status: BlockStatus) -> BlockStatus {
        if pkt.command == Command::UpgradeReq {
            // A successful upgrade keeps the resident data (CacheBlk::data is
            // untouched by the caller), only gaining write permission without
            // a data transfer.
            return Self::status_of(MsiState::Modified);
        }
        if pkt.is_write() {
            Self::status_of(MsiState::Modified)
        } else {
            Self::status_of(MsiState::Shared)
        }
    }

    fn handle_bus_request(&self, pkt: &Packet, have_status: Option<BlockStatus>) -> SnoopOutcome {
        let Some(status) = have_status else {
            return SnoopOutcome {
                supplied: false,
                new_status: None,
            };
        };
        match pkt.command {
            Command::ReadReq if status.dirty => SnoopOutcome {
                supplied: true,
                new_status: Some(Self::status_of(MsiState::Shared)),
            },
            Command::ReadReq => SnoopOutcome {
                supplied: false,
                new_status: Some(Self::status_of(MsiState::Shared)),
            },
            Command::InvalidateReq | Command::UpgradeReq | Command::WriteInvalidateReq => SnoopOutcome {
                supplied: status.dirty,
                new_status: Some(BlockStatus::INVALID),
            },
            _ => SnoopOutcome {
                supplied: false,
                new_status: Some(status),
            },
        }
    }

    fn allow_fast_writes(&self) -> bool {
        false
    }

    fn has_protocol(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AccessFlags, Request};
    use std::rc::Rc;

    fn pkt(cmd: Command) -> Packet {
        let req = Rc::new(Request::new(0x40, 8, AccessFlags::default(), 0, 0, 0, 0));
        Packet::new(req, cmd, 0x40, 8, 0)
    }

    #[test]
    fn msi_read_req_does_not_grant_write_permission() {
        let status = MsiCoherence.next_state(&pkt(Command::ReadReq), BlockStatus::INVALID);
        assert!(!status.writable);
        assert!(status.readable);
    }

    #[test]
    fn msi_write_req_grants_modified() {
        let status = MsiCoherence.next_state(&pkt(Command::WriteReq), BlockStatus::INVALID);
        assert!(status.writable);
        assert!(status.dirty);
    }

    #[test]
    fn msi_snoop_invalidate_on_shared_line_does_not_supply_data() {
        let shared = BlockStatus {
            valid: true,
            writable: false,
            dirty: false,
            readable: true,
            prefetched: false,
        };
        let outcome = MsiCoherence.handle_bus_request(&pkt(Command::InvalidateReq), Some(shared));
        assert!(!outcome.supplied);
        assert_eq!(outcome.new_status, Some(BlockStatus::INVALID));
    }

    #[test]
    fn null_coherence_always_allows_fast_writes() {
        assert!(NullCoherence.allow_fast_writes());
        assert!(!MsiCoherence.allow_fast_writes());
    }

    #[test]
    fn propagate_invalidate_default_is_a_harmless_no_op() {
        // Neither driver has an upstream cache in this hierarchy, so the
        // hook exists only to be called; it must not panic either mode.
        NullCoherence.propagate_invalidate(&pkt(Command::InvalidateReq), true);
        MsiCoherence.propagate_invalidate(&pkt(Command::InvalidateReq), false);
    }
}
