// Copyright (C) 2025 piolink contributors
//
// MIT License

//! piolink-core library
//!
//! Hardware-independent debug concepts used by the piolink SWD/RISC-V debug
//! stack:
//!
//! * [`arm`] - ARM Debug Port registers, SWD request encoding and ACK
//!   handling, per ADIv5.
//! * [`riscv`] - RISC-V External Debug Support (0.13) Debug Module
//!   registers, DMI frame layout, instruction encoders and register
//!   numbering.
//! * [`slots`] - the PIO block/state machine ownership map.
//!
//! This crate has no hardware dependencies and is usable (and testable) on
//! any target.  The wire protocol and drivers built on these concepts live
//! in `piolink-swd`.

#![no_std]

pub mod arm;
pub mod riscv;
pub mod slots;

#[doc(inline)]
pub use crate::arm::request::{Ack, SwdOp};
#[doc(inline)]
pub use crate::slots::{PioBlock, Slot, SlotMap};

/// Calculate SWD parity - 1 for an odd number of bits set to 1, 0 otherwise.
pub fn calculate_parity<T>(value: T) -> bool
where
    T: Into<u64>,
{
    (value.into().count_ones() % 2) == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity() {
        assert!(!calculate_parity(0u32));
        assert!(calculate_parity(1u32));
        assert!(calculate_parity(0x8000_0000u32));
        assert!(!calculate_parity(0x8000_0001u32));
        assert!(!calculate_parity(0xFFFF_FFFFu32));
    }
}
