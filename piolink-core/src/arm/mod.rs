// Copyright (C) 2025 piolink contributors
//
// MIT License

//! ARM ADIv5 debug concepts - Debug Port registers and SWD requests.
//!
//! Only the Debug Port side of ADIv5 is modelled here.  The RP2350 exposes
//! its RISC-V Debug Module through a dedicated Access Port with a custom
//! register layout, so Access Port traffic in this stack is raw 32-bit
//! register access (see `piolink_core::riscv::dmi`) rather than the MEM-AP
//! register set.

pub mod dp;
pub mod register;
pub mod request;
