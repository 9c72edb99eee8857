//! Error taxonomy.
//!
//! The hierarchy distinguishes four kinds of "something went wrong", each
//! handled a different way: a split between
//! `thiserror`-derived library errors (setup/config mistakes, returned as
//! `Result`) and protocol-internal conditions that are never `Result`s at
//! all: a fatal programmer error panics, a protocol anomaly is logged and
//! survived, and a simulated fault is an ordinary value threaded back to the
//! CPU through [`crate::translation::Translation`].

use thiserror::Error;

use crate::Address;

/// Configuration and setup mistakes, caught before simulation starts.
///
/// These are the only conditions in the crate that surface as `Result`:
/// everything that happens once the cache controller is running is either a
/// [`Fault`], a logged protocol anomaly, or a transport-level
/// [`crate::packet::PacketResult::Nacked`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("number of sets must be a power of two, got {0}")]
    SetsNotPowerOfTwo(usize),

    #[error("block size must be a power of two, got {0}")]
    BlockSizeNotPowerOfTwo(u32),

    #[error("associativity must be at least 1, got 0")]
    ZeroAssociativity,

    #[error("MSHR capacity must be at least 1, got 0")]
    ZeroMshrCapacity,

    #[error("writeback buffer capacity must be at least 1, got 0")]
    ZeroWritebackCapacity,
}

/// A fault raised by address translation or by the memory system on behalf
/// of the architectural CPU (e.g. a page fault, or an access to an
/// unmapped/poisoned physical address). Faults are simulated outcomes, not
/// implementation errors, and are returned as ordinary values rather than
/// panics.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("no valid translation for address {0:#x}")]
    PageFault(Address),
    #[error("access to address {0:#x} is not backed by any memory")]
    BadAddress(Address),
    #[error("alignment violation accessing address {0:#x}")]
    Misaligned(Address),
}
