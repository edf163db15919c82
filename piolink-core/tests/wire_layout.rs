// Copyright (C) 2025 piolink contributors
//
// MIT License

//! Cross-module checks of the on-wire layouts: the SWD requests, DMI
//! frames and program-buffer snippets that a halt-and-read-memory
//! session actually produces.

use piolink_core::arm::request::SwdOp;
use piolink_core::calculate_parity;
use piolink_core::riscv::dm::{addr, AccessRegisterCommand, Dmcontrol};
use piolink_core::riscv::dmi::{DmiFrame, DmiOp};
use piolink_core::riscv::{asm, regs, DMI_APSEL};

#[test]
fn dmi_carrier_requests() {
    // The DMI low/high words ride on AP registers 0x0 and 0x4
    assert_eq!(SwdOp::ApWrite(0x00).request(), 0xA3);
    assert_eq!(SwdOp::ApWrite(0x04).request(), 0x8B);
    assert_eq!(SwdOp::ApRead(0x00).request(), 0x87);
    assert_eq!(SwdOp::ApRead(0x04).request(), 0xAF);
    // Both live in AP bank 0 of the RISC-V AP
    assert_eq!(DMI_APSEL, 2);
}

#[test]
fn halt_request_frame() {
    // dmcontrol with haltreq for hart 1, packed for the wire
    let mut control = Dmcontrol::select_hart(1);
    control.set_haltreq(true);
    assert_eq!(control.0, 0x8001_0001);

    let frame = DmiFrame::pack(addr::DMCONTROL as u32, control.0, DmiOp::Write);
    assert_eq!(frame.lo, (0x8001_0001u32 << 2) | 2);
    assert_eq!(frame.hi, (0x10 << 2) | (0x8001_0001u32 >> 30));
    assert_eq!(frame.data(), control.0);
}

#[test]
fn memory_read_snippet() {
    // The program-buffer memory read is lw s1, 0(s0) plus the abstract
    // command that loads s0 and runs the buffer
    let load = asm::lw(
        0,
        regs::SCRATCH_S0 as u32,
        asm::WIDTH_32,
        regs::SCRATCH_S1 as u32,
    );
    assert_eq!(load, 0x0004_2483);

    let mut command = AccessRegisterCommand::transfer32(regs::gpr(regs::SCRATCH_S0), true);
    command.set_postexec(true);
    assert!(command.transfer());
    assert!(command.write());
    assert!(command.postexec());
    assert_eq!(command.regno(), 0x1008);
}

#[test]
fn walking_ones_parity() {
    // Every walking-ones data word carries odd parity on the wire
    for bit in 0..32 {
        assert!(calculate_parity(1u32 << bit));
    }
}
