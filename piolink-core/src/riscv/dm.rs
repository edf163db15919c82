// Copyright (C) 2025 piolink contributors
//
// MIT License

//! Debug Module register definitions (RISC-V External Debug Support 0.13)
//!
//! Addresses are DMI addresses, not byte addresses.

use bitfield::bitfield;

/// DMI addresses of the Debug Module registers used by this stack
pub mod addr {
    pub const DATA0: u8 = 0x04;
    pub const DMCONTROL: u8 = 0x10;
    pub const DMSTATUS: u8 = 0x11;
    pub const HARTINFO: u8 = 0x12;
    pub const ABSTRACTCS: u8 = 0x16;
    pub const COMMAND: u8 = 0x17;
    pub const PROGBUF0: u8 = 0x20;
    pub const SBCS: u8 = 0x38;
    pub const SBADDRESS0: u8 = 0x39;
    pub const SBDATA0: u8 = 0x3C;
}

bitfield! {
    /// `dmcontrol` register, DMI address 0x10
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    /// An active DM with the given hart selected and no requests pending
    pub fn select_hart(hart: u8) -> Self {
        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        control.set_hartsello(hart as u32);
        control
    }
}

bitfield! {
    /// Read-only `dmstatus` register, DMI address 0x11
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub version, _: 3, 0;
}

/// Debug specification version reported in `dmstatus.version` for 0.13
pub const DMSTATUS_VERSION_0_13: u32 = 2;

bitfield! {
    /// Read-only `hartinfo` register, DMI address 0x12
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Hartinfo(u32);
    impl Debug;

    pub nscratch, _: 23, 20;
    pub dataaccess, _: 16;
    pub datasize, _: 15, 12;
    pub dataaddr, _: 11, 0;
}

bitfield! {
    /// `abstractcs` register, DMI address 0x16
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub cmderr, set_cmderr: 10, 8;
    pub datacount, _: 3, 0;
}

/// Errors reported in `abstractcs.cmderr` after an abstract command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCmdErr {
    Busy,
    NotSupported,
    Exception,
    HaltResume,
    Bus,
    Other,
}

impl AbstractCmdErr {
    /// Parse a non-zero `cmderr` value
    pub fn from_cmderr(value: u32) -> Option<Self> {
        match value & 0x7 {
            0 => None,
            1 => Some(AbstractCmdErr::Busy),
            2 => Some(AbstractCmdErr::NotSupported),
            3 => Some(AbstractCmdErr::Exception),
            4 => Some(AbstractCmdErr::HaltResume),
            5 => Some(AbstractCmdErr::Bus),
            _ => Some(AbstractCmdErr::Other),
        }
    }
}

bitfield! {
    /// Access Register abstract command encoding (`command`, DMI address 0x17)
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub cmdtype, set_cmdtype: 31, 24;
    pub aarsize, set_aarsize: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub regno, set_regno: 15, 0;
}

/// `aarsize` value for 32-bit register access
pub const AARSIZE_32: u32 = 2;

impl AccessRegisterCommand {
    /// A 32-bit register transfer command for the given abstract regno
    pub fn transfer32(regno: u16, write: bool) -> Self {
        let mut command = AccessRegisterCommand(0);
        command.set_aarsize(AARSIZE_32);
        command.set_transfer(true);
        command.set_write(write);
        command.set_regno(regno as u32);
        command
    }

    /// A command that only runs the program buffer, with no transfer
    pub fn execute_progbuf() -> Self {
        let mut command = AccessRegisterCommand(0);
        command.set_aarsize(AARSIZE_32);
        command.set_postexec(true);
        command
    }
}

bitfield! {
    /// `sbcs` System Bus Access control and status, DMI address 0x38
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Sbcs(u32);
    impl Debug;

    pub sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub sberror, set_sberror: 14, 12;
    pub sbasize, _: 11, 5;
    pub sbaccess32, _: 2;
}

/// `sbaccess` value for 32-bit transfers
pub const SBACCESS_32: u32 = 2;

bitfield! {
    /// `dcsr` debug CSR (0x7b0) fields
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Dcsr(u32);
    impl Debug;

    pub xdebugver, _: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub cause, _: 8, 6;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dmcontrol_hart_select() {
        let control = Dmcontrol::select_hart(1);
        assert_eq!(control.0, (1 << 16) | 1);
        assert!(control.dmactive());
        assert_eq!(control.hartsello(), 1);
        assert!(!control.haltreq());
    }

    #[test]
    fn dmcontrol_requests() {
        let mut control = Dmcontrol::select_hart(0);
        control.set_haltreq(true);
        assert_eq!(control.0, 0x8000_0001);
        control.set_haltreq(false);
        control.set_resumereq(true);
        assert_eq!(control.0, 0x4000_0001);
    }

    #[test]
    fn dmstatus_fields() {
        // All harts halted, version 0.13
        let status = Dmstatus((1 << 9) | (1 << 8) | 2);
        assert!(status.allhalted());
        assert!(status.anyhalted());
        assert!(!status.allrunning());
        assert_eq!(status.version(), DMSTATUS_VERSION_0_13);
    }

    #[test]
    fn abstractcs_cmderr() {
        let status = Abstractcs(2 << 8);
        assert_eq!(
            AbstractCmdErr::from_cmderr(status.cmderr()),
            Some(AbstractCmdErr::NotSupported)
        );
        assert_eq!(AbstractCmdErr::from_cmderr(0), None);
    }

    #[test]
    fn access_register_transfer() {
        // Read GPR x5 (abstract regno 0x1005)
        let command = AccessRegisterCommand::transfer32(0x1005, false);
        assert_eq!(command.0, 0x0022_1005);

        // Write form sets bit 16
        let command = AccessRegisterCommand::transfer32(0x1005, true);
        assert_eq!(command.0, 0x0023_1005);
    }

    #[test]
    fn access_register_postexec() {
        let command = AccessRegisterCommand::execute_progbuf();
        assert!(command.postexec());
        assert!(!command.transfer());
        assert_eq!(command.aarsize(), AARSIZE_32);
    }

    #[test]
    fn sbcs_word_config() {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(SBACCESS_32);
        sbcs.set_sbautoincrement(true);
        sbcs.set_sbreadonaddr(true);
        sbcs.set_sbreadondata(true);
        assert_eq!(sbcs.0, (1 << 20) | (2 << 17) | (1 << 16) | (1 << 15));
    }

    #[test]
    fn dcsr_step() {
        let mut dcsr = Dcsr(0x4000_0003);
        assert!(!dcsr.step());
        dcsr.set_step(true);
        assert_eq!(dcsr.0, 0x4000_0007);
        assert_eq!(dcsr.prv(), 3);
    }
}
