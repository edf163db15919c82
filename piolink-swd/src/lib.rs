// Copyright (C) 2025 piolink contributors
//
// MIT License

//! piolink-swd library
//!
//! In-circuit debugging of the RP2350's RISC-V (Hazard3) cores over
//! [ARM SWD](https://developer.arm.com/documentation/ihi0031/latest/),
//! driven from another RP2350 acting as the debug host.  The SWD waveform
//! is generated by a PIO state machine, so the host CPU never bit-bangs
//! individual clock edges.
//!
//! The following diagram shows the layering:
//!
//! ```text
//!        Application
//! ----------------------
//!         Target          - session lifecycle, PIO slot ownership
//! ----------------------
//!       DebugModule       - RISC-V debug: halt/resume/step, registers,
//! ----------------------    program buffer, system bus access, tracing
//!       DmiTransport      - Debug Module Interface over the RISC-V AP
//! ----------------------
//!       DapInterface      - ADIv5 DP/AP session, SELECT cache
//! ----------------------
//!        SwdEngine        - PIO waveform engine, ACK/WAIT/parity
//! ----------------------
//!    RP2350 host PIO+GPIO >=====================<  RP2350 target SWD
//! ```
//!
//! Most applications only use [`Target`]; the lower layers are exposed for
//! tooling that needs finer control.
//!
//! It is `no_std` and requires an `alloc` implementation for error detail
//! strings.  Delays and timeouts use [`embassy-time`](https://embassy.dev/),
//! so the application binary must provide a time driver.

#![no_std]

pub mod dap;
pub mod dm;
pub mod dmi;
pub mod engine;
pub mod target;
pub mod trace;

#[doc(inline)]
pub use crate::dap::DapInterface;
#[doc(inline)]
pub use crate::dm::DebugModule;
#[doc(inline)]
pub use crate::engine::SwdEngine;
#[doc(inline)]
pub use crate::target::{resource_usage, Config, Target};
#[doc(inline)]
pub use crate::trace::TraceRecord;

pub use piolink_core::slots::{PioBlock, Slot, SlotUsage};

extern crate alloc;
use core::fmt;
use piolink_core::arm::request::Ack;

/// Core error type used by all piolink-swd objects
///
/// The discriminants are stable (0 is reserved for success); machine logic
/// must rely only on the tag - the session's textual detail is for human
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwdError {
    /// Operation timed out
    Timeout = 1,

    /// Target returned FAULT ACK.  The DAP layer classifies and clears the
    /// sticky flags before returning this; the operation is not retried.
    Fault = 2,

    /// SWD protocol error - an unrecognised ACK pattern, an invalid IDCODE,
    /// or an unexpected DMI status.  Usually requires a new
    /// [`Target::connect()`].
    Protocol = 3,

    /// Parity check failed on read data.  The data cannot be trusted.
    /// Frequent parity errors suggest noise on the SWD lines or a clock
    /// too fast for the wiring.
    Parity = 4,

    /// Target returned WAIT ACK and the retry budget was exhausted
    Wait = 5,

    /// Target not connected
    NotConnected = 6,

    /// Operation requires the hart to be halted
    NotHalted = 7,

    /// Hart is already halted.  Informational - callers may treat this as
    /// success.
    AlreadyHalted = 8,

    /// Invalid state for this operation
    InvalidState = 9,

    /// Memory allocation failed
    NoMemory = 10,

    /// Invalid configuration passed to [`Target::new()`]
    InvalidConfig = 11,

    /// The requested PIO slot is already owned by another session
    ResourceBusy = 12,

    /// Invalid parameter
    InvalidParam = 13,

    /// Debug Module not initialized - call [`Target::dm_init()`] first
    NotInitialized = 14,

    /// An abstract command failed (`abstractcs.cmderr` non-zero)
    AbstractCmd = 15,

    /// System bus access error
    Bus = 16,

    /// Memory address alignment error
    Alignment = 17,

    /// Read-back verification failed
    Verify = 18,
}

impl SwdError {
    pub(crate) fn from_ack(ack: Ack) -> Result<(), SwdError> {
        match ack {
            Ack::Ok => Ok(()),
            Ack::Wait => Err(SwdError::Wait),
            Ack::Fault => Err(SwdError::Fault),
            Ack::Invalid(_) => Err(SwdError::Protocol),
        }
    }

    /// Stable numeric code for this error.  0 is success and never appears
    /// here.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// True for markers that callers may treat as success
    pub fn is_informational(&self) -> bool {
        matches!(self, SwdError::AlreadyHalted)
    }

    /// True if the error indicates the DP sticky flags were set and have
    /// been cleared via ABORT on the way out
    pub fn cleared_sticky(&self) -> bool {
        matches!(
            self,
            SwdError::Fault | SwdError::Parity | SwdError::Protocol | SwdError::Wait
        )
    }

    /// Returns a string representation of the error.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwdError::Timeout => "Timeout",
            SwdError::Fault => "Target fault",
            SwdError::Protocol => "Protocol error",
            SwdError::Parity => "Parity error",
            SwdError::Wait => "Wait timeout",
            SwdError::NotConnected => "Not connected",
            SwdError::NotHalted => "Hart not halted",
            SwdError::AlreadyHalted => "Hart already halted",
            SwdError::InvalidState => "Invalid state",
            SwdError::NoMemory => "Out of memory",
            SwdError::InvalidConfig => "Invalid configuration",
            SwdError::ResourceBusy => "Resource busy",
            SwdError::InvalidParam => "Invalid parameter",
            SwdError::NotInitialized => "Debug module not initialized",
            SwdError::AbstractCmd => "Abstract command failed",
            SwdError::Bus => "Bus error",
            SwdError::Alignment => "Alignment error",
            SwdError::Verify => "Verification failed",
        }
    }
}

impl fmt::Display for SwdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_numbering() {
        assert_eq!(SwdError::Timeout.code(), 1);
        assert_eq!(SwdError::Wait.code(), 5);
        assert_eq!(SwdError::AlreadyHalted.code(), 8);
        assert_eq!(SwdError::NotInitialized.code(), 14);
        assert_eq!(SwdError::Verify.code(), 18);
    }

    #[test]
    fn ack_mapping() {
        assert_eq!(SwdError::from_ack(Ack::Ok), Ok(()));
        assert_eq!(SwdError::from_ack(Ack::Wait), Err(SwdError::Wait));
        assert_eq!(SwdError::from_ack(Ack::Fault), Err(SwdError::Fault));
        assert_eq!(
            SwdError::from_ack(Ack::Invalid(0b111)),
            Err(SwdError::Protocol)
        );
    }

    #[test]
    fn informational_markers() {
        assert!(SwdError::AlreadyHalted.is_informational());
        assert!(!SwdError::NotHalted.is_informational());
    }
}
