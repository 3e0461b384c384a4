// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the ARMv6-M simulator workspace: the exception number
//! space, the architectural fault taxonomy, and the cross-crate error type.
//!
//! This crate has no dependency on any other crate in the workspace so that
//! every other crate (and any future peripheral or tool) can share one
//! vocabulary for faults instead of inventing its own.

#![forbid(unsafe_code)]

use thiserror::Error;

/// A fixed ARMv6-M exception number, 1..=47.
///
/// Numbers 1-15 are the system exceptions (Reset, NMI, HardFault, SVCall,
/// PendSV, SysTick, and reserved slots); 16-47 are external IRQ0..IRQ31.
pub type ExceptionNumber = u16;

pub const EXC_RESET: ExceptionNumber = 1;
pub const EXC_NMI: ExceptionNumber = 2;
pub const EXC_HARDFAULT: ExceptionNumber = 3;
pub const EXC_SVCALL: ExceptionNumber = 11;
pub const EXC_PENDSV: ExceptionNumber = 14;
pub const EXC_SYSTICK: ExceptionNumber = 15;
pub const EXC_IRQ0: ExceptionNumber = 16;
pub const EXC_MAX: ExceptionNumber = 47;

/// Fixed priorities for the three exceptions whose priority is not
/// software-configurable, expressed on the same signed scale as the
/// configurable 4-bit priorities (0 = highest among configurable, negative
/// = higher still).
pub const PRIO_RESET: i8 = -3;
pub const PRIO_NMI: i8 = -2;
pub const PRIO_HARDFAULT: i8 = -1;

/// Execution priority of thread mode: lower than any exception priority.
pub const PRIO_THREAD: i16 = 0x100;

/// EXC_RETURN magic values (ARMv6-M defines exactly these three).
pub const EXC_RETURN_HANDLER_MSP: u32 = 0xFFFF_FFF1;
pub const EXC_RETURN_THREAD_MSP: u32 = 0xFFFF_FFF9;
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Returns `true` if `value`'s top 28 bits are all set, i.e. it is shaped
/// like an EXC_RETURN value regardless of whether the low nibble is one of
/// the three values ARMv6-M actually defines.
pub fn looks_like_exc_return(value: u32) -> bool {
    value & 0xFFFF_FFF0 == 0xFFFF_FFF0
}

/// Faults arising from architectural rule violations. These are resolved by
/// the CPU itself (delivered as an exception, or ending the simulation for
/// the handful of kinds that have no architectural handler) rather than
/// surfaced to callers as `Result::Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Bus access to an address no device claims.
    AddressError { address: u32 },
    /// Word or halfword access whose address was not naturally aligned.
    AlignmentError { address: u32, width: u8 },
    /// The decoder could not classify an opcode as a valid ARMv6-M
    /// encoding.
    DecodeError { opcode: u32, pc: u32 },
    /// A register index outside 0..=15 was used internally. This is a
    /// simulator bug, not an architectural condition, and has no
    /// exception-based recovery.
    InvalidRegister { index: u32 },
    /// A fault was raised while HardFault was already the active
    /// exception; the processor has no lower fault to escalate to.
    NestedFault,
    /// `BX`/`BLX` targeted a register whose bit 0 was clear, which on
    /// ARMv6-M requests a switch to ARM state. No such state exists on
    /// this architecture.
    ArmStateUnsupported { target: u32 },
}

impl FaultKind {
    /// Whether this fault has an architectural exception to escalate to.
    /// `InvalidRegister` does not: it means the simulator itself violated
    /// its own invariants, not that the simulated program did.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FaultKind::InvalidRegister { .. } | FaultKind::NestedFault)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::AddressError { address } => {
                write!(f, "no device mapped at address {address:#010x}")
            }
            FaultKind::AlignmentError { address, width } => {
                write!(f, "unaligned {width}-byte access at {address:#010x}")
            }
            FaultKind::DecodeError { opcode, pc } => {
                write!(f, "undefined encoding {opcode:#06x} at pc {pc:#010x}")
            }
            FaultKind::InvalidRegister { index } => {
                write!(f, "invalid register index {index}")
            }
            FaultKind::NestedFault => write!(f, "fault while HardFault was active (lockup)"),
            FaultKind::ArmStateUnsupported { target } => {
                write!(f, "branch to {target:#010x} requested ARM state, which this core does not implement")
            }
        }
    }
}

/// Errors that cross crate boundaries and that the architecture itself does
/// not resolve: malformed input files, protocol errors, I/O failures. These
/// are the only errors a caller should ever need to `match` on; everything
/// the CPU itself can turn into an exception uses [`FaultKind`] instead.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("malformed Intel HEX record: {0}")]
    HexParseError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDB protocol error: {0}")]
    GdbProtocol(String),

    #[error("no device named {0:?} is registered on the bus")]
    UnknownDevice(String),

    #[error("device {name:?} at {base:#010x}..{end:#010x} overlaps {other:?} at {other_base:#010x}..{other_end:#010x}")]
    OverlappingDevice {
        name: String,
        base: u32,
        end: u32,
        other: String,
        other_base: u32,
        other_end: u32,
    },

    #[error("simulation halted: {0}")]
    Halted(FaultKind),
}
