// Copyright (C) 2025 piolink contributors
//
// MIT License

//! RISC-V Debug Module driver
//!
//! Implements the Debug Module operations of the RISC-V External Debug
//! Support specification 0.13 on top of [`DmiTransport`]: hart run
//! control, abstract register access, the program buffer, System Bus
//! Access, and the memory routing policy between the last two.

use core::result::Result;
use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{PIOExt, StateMachineIndex};

use crate::dmi::DmiTransport;
use crate::SwdError;
use piolink_core::riscv::dm::{
    addr, AbstractCmdErr, Abstractcs, AccessRegisterCommand, Dcsr, Dmcontrol, Dmstatus, Hartinfo,
    Sbcs, DMSTATUS_VERSION_0_13, SBACCESS_32,
};
use piolink_core::riscv::dmi::DEFAULT_ABITS;
use piolink_core::riscv::{asm, regs, NUM_HARTS};

// Bounded waits for the various DM polling loops
const HALT_TIMEOUT: Duration = Duration::from_millis(100);
const RESUME_TIMEOUT: Duration = Duration::from_millis(100);
const ABSTRACT_TIMEOUT: Duration = Duration::from_millis(100);
const SBA_TIMEOUT: Duration = Duration::from_millis(100);
const INIT_TIMEOUT: Duration = Duration::from_millis(200);

// Hold time for ndmreset assertion
const RESET_HOLD: Duration = Duration::from_millis(10);

// Program buffer cache; the RP2350 DM has at most this many words
const PROGBUF_CACHE_WORDS: usize = 16;

/// Per-hart state tracked by the driver
///
/// `halt_state_known` is falsified by any resume or reset and reasserted
/// by an explicit status read.  A valid register cache implies the hart
/// was halted with known state at the moment of caching; any operation
/// that resumes, steps, resets or mutates a register falsifies it.
#[derive(Debug, Clone, Copy)]
pub struct HartState {
    pub halted: bool,
    pub halt_state_known: bool,
    cache_valid: bool,
    cached_pc: Option<u32>,
    cached_gprs: [u32; 32],
}

impl HartState {
    const fn new() -> Self {
        HartState {
            halted: false,
            halt_state_known: false,
            cache_valid: false,
            cached_pc: None,
            cached_gprs: [0; 32],
        }
    }

    fn invalidate(&mut self) {
        self.cache_valid = false;
        self.cached_pc = None;
    }
}

/// RISC-V Debug Module driver
///
/// Used by [`crate::Target`]; exposed for tooling that needs direct DM
/// access.  All hart arguments are validated against the RP2350's two
/// harts.
pub struct DebugModule<P: PIOExt, SM: StateMachineIndex> {
    dmi: DmiTransport<P, SM>,
    initialized: bool,
    cache_enabled: bool,
    selected_hart: Option<u8>,
    harts: [HartState; NUM_HARTS as usize],

    // Discovered at init
    progbuf_size: u8,
    datacount: u8,
    impebreak: bool,
    sba_supported: bool,

    progbuf_cache: [u32; PROGBUF_CACHE_WORDS],
    progbuf_cache_len: usize,
}

impl<P: PIOExt, SM: StateMachineIndex> DebugModule<P, SM> {
    pub fn new(dmi: DmiTransport<P, SM>, cache_enabled: bool) -> Self {
        Self {
            dmi,
            initialized: false,
            cache_enabled,
            selected_hart: None,
            harts: [HartState::new(); NUM_HARTS as usize],
            progbuf_size: 0,
            datacount: 0,
            impebreak: false,
            sba_supported: false,
            progbuf_cache: [0; PROGBUF_CACHE_WORDS],
            progbuf_cache_len: 0,
        }
    }

    /// Access the underlying DMI transport
    pub fn dmi(&mut self) -> &mut DmiTransport<P, SM> {
        &mut self.dmi
    }

    /// Shared access to the underlying DMI transport
    pub fn dmi_ref(&self) -> &DmiTransport<P, SM> {
        &self.dmi
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Snapshot of the tracked state for a hart
    pub fn hart_state(&self, hart: u8) -> Option<HartState> {
        (hart < NUM_HARTS).then(|| self.harts[hart as usize])
    }

    /// Program buffer size in words, as discovered at init
    pub fn progbuf_size(&self) -> u8 {
        self.progbuf_size
    }

    /// Whether 32-bit System Bus Access is available
    pub fn sba_supported(&self) -> bool {
        self.sba_supported
    }

    /// Activate the Debug Module and discover its capabilities.
    ///
    /// Writes `dmcontrol.dmactive`, waits for the module to respond, then
    /// reads the version, program buffer size, data register count,
    /// hartinfo and SBA capabilities.
    pub async fn init(&mut self) -> Result<(), SwdError> {
        trace!("Exec:  DM init");
        self.initialized = false;
        self.selected_hart = None;
        self.progbuf_cache_len = 0;
        for hart in self.harts.iter_mut() {
            hart.halt_state_known = false;
            hart.invalidate();
        }

        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;

        // Wait for the module to come out of reset
        let deadline = Instant::now() + INIT_TIMEOUT;
        loop {
            let control = Dmcontrol(self.dmi.dmi_read(addr::DMCONTROL).await?);
            if control.dmactive() {
                break;
            }
            if Instant::now() > deadline {
                warn!("Debug module did not activate");
                return Err(SwdError::Timeout);
            }
            Timer::after_micros(100).await;
        }

        let status = Dmstatus(self.dmi.dmi_read(addr::DMSTATUS).await?);
        if status.version() != DMSTATUS_VERSION_0_13 {
            warn!("Unsupported debug module version {}", status.version());
            return Err(SwdError::Protocol);
        }
        self.impebreak = status.impebreak();

        // The module is responsive once it reports coherent hart status
        self.poll_dmstatus(|s| s.allrunning() || s.allhalted(), INIT_TIMEOUT)
            .await?;

        // The RP2350 DMI register map fits the minimum address width
        self.dmi.set_abits(DEFAULT_ABITS);

        let abstractcs = Abstractcs(self.dmi.dmi_read(addr::ABSTRACTCS).await?);
        self.progbuf_size = abstractcs.progbufsize() as u8;
        self.datacount = abstractcs.datacount() as u8;
        if abstractcs.cmderr() != 0 {
            self.clear_cmderr().await?;
        }

        let hartinfo = Hartinfo(self.dmi.dmi_read(addr::HARTINFO).await?);
        debug!(
            "DM: progbuf {} words, datacount {}, nscratch {}, impebreak {}",
            self.progbuf_size,
            self.datacount,
            hartinfo.nscratch(),
            self.impebreak
        );

        let sbcs = Sbcs(self.dmi.dmi_read(addr::SBCS).await?);
        self.sba_supported = sbcs.sbaccess32();
        debug!(
            "DM: sba32 {}, sbasize {} bits",
            self.sba_supported,
            sbcs.sbasize()
        );

        self.initialized = true;
        Ok(())
    }

    //==========================================================================
    // Run control
    //==========================================================================

    /// Query and record whether a hart is halted
    pub async fn is_halted(&mut self, hart: u8) -> Result<bool, SwdError> {
        self.check_hart(hart)?;
        self.require_initialized()?;
        self.select_hart(hart).await?;

        let status = Dmstatus(self.dmi.dmi_read(addr::DMSTATUS).await?);
        let state = &mut self.harts[hart as usize];
        state.halted = status.allhalted();
        state.halt_state_known = true;
        Ok(state.halted)
    }

    /// Halt a hart.
    ///
    /// Returns `Err(SwdError::AlreadyHalted)` - an informational marker -
    /// if the hart is already halted; the hart state is unchanged.
    pub async fn halt(&mut self, hart: u8) -> Result<(), SwdError> {
        if self.is_halted(hart).await? {
            debug!("Hart {hart} already halted");
            return Err(SwdError::AlreadyHalted);
        }

        let mut control = Dmcontrol::select_hart(hart);
        control.set_haltreq(true);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;

        let result = self.poll_dmstatus(|s| s.allhalted(), HALT_TIMEOUT).await;

        // Drop the halt request whether or not the hart acknowledged
        self.dmi
            .dmi_write(addr::DMCONTROL, Dmcontrol::select_hart(hart).0)
            .await?;
        result?;

        let state = &mut self.harts[hart as usize];
        state.halted = true;
        state.halt_state_known = true;
        debug!("Hart {hart} halted");
        Ok(())
    }

    /// Resume a halted hart
    pub async fn resume(&mut self, hart: u8) -> Result<(), SwdError> {
        self.require_halted(hart).await?;
        self.harts[hart as usize].invalidate();

        let mut control = Dmcontrol::select_hart(hart);
        control.set_resumereq(true);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;

        let result = self
            .poll_dmstatus(|s| s.allresumeack(), RESUME_TIMEOUT)
            .await;

        self.dmi
            .dmi_write(addr::DMCONTROL, Dmcontrol::select_hart(hart).0)
            .await?;
        result?;

        let state = &mut self.harts[hart as usize];
        state.halted = false;
        state.halt_state_known = false;
        debug!("Hart {hart} resumed");
        Ok(())
    }

    /// Single-step a halted hart: one instruction retires, then the hart
    /// halts again with the PC advanced.
    pub async fn step(&mut self, hart: u8) -> Result<(), SwdError> {
        self.require_halted(hart).await?;

        let mut dcsr = Dcsr(self.read_csr_selected(regs::CSR_DCSR).await?);
        dcsr.set_step(true);
        self.write_csr_selected(regs::CSR_DCSR, dcsr.0).await?;
        self.harts[hart as usize].invalidate();

        let mut control = Dmcontrol::select_hart(hart);
        control.set_resumereq(true);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;

        // Wait for the resume to be acknowledged, then for the hart to
        // re-enter debug mode after one instruction
        let result = match self
            .poll_dmstatus(|s| s.allresumeack(), RESUME_TIMEOUT)
            .await
        {
            Ok(_) => self.poll_dmstatus(|s| s.allhalted(), RESUME_TIMEOUT).await,
            Err(e) => Err(e),
        };

        self.dmi
            .dmi_write(addr::DMCONTROL, Dmcontrol::select_hart(hart).0)
            .await?;
        result?;

        dcsr.set_step(false);
        self.write_csr_selected(regs::CSR_DCSR, dcsr.0).await?;

        let state = &mut self.harts[hart as usize];
        state.halted = true;
        state.halt_state_known = true;
        Ok(())
    }

    /// Reset the target.
    ///
    /// Asserts `ndmreset`, holds it, and releases it.  With `halt_after`
    /// the halt request is kept pending across the release so the hart
    /// halts at its reset vector.  Both harts' tracked state is
    /// falsified - `ndmreset` resets the whole non-debug system.
    pub async fn reset(&mut self, hart: u8, halt_after: bool) -> Result<(), SwdError> {
        self.check_hart(hart)?;
        self.require_initialized()?;

        let mut control = Dmcontrol::select_hart(hart);
        control.set_ndmreset(true);
        control.set_haltreq(halt_after);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;
        self.selected_hart = Some(hart);

        Timer::after(RESET_HOLD).await;

        let mut control = Dmcontrol::select_hart(hart);
        control.set_haltreq(halt_after);
        self.dmi.dmi_write(addr::DMCONTROL, control.0).await?;

        for state in self.harts.iter_mut() {
            state.halted = false;
            state.halt_state_known = false;
            state.invalidate();
        }

        if halt_after {
            let result = self.poll_dmstatus(|s| s.allhalted(), HALT_TIMEOUT).await;
            self.dmi
                .dmi_write(addr::DMCONTROL, Dmcontrol::select_hart(hart).0)
                .await?;
            result?;

            let state = &mut self.harts[hart as usize];
            state.halted = true;
            state.halt_state_known = true;
        }

        debug!("Hart {hart} reset (halt_after={halt_after})");
        Ok(())
    }

    //==========================================================================
    // GPR access
    //==========================================================================

    /// Read a general purpose register.  `x0` reads as zero without a bus
    /// transaction.
    pub async fn read_reg(&mut self, hart: u8, regno: u8) -> Result<u32, SwdError> {
        self.check_hart(hart)?;
        if regno >= 32 {
            return Err(SwdError::InvalidParam);
        }
        if regno == 0 {
            return Ok(0);
        }
        self.require_halted(hart).await?;

        let state = &self.harts[hart as usize];
        if self.cache_enabled && state.cache_valid {
            return Ok(state.cached_gprs[regno as usize]);
        }
        self.abstract_reg_read(regs::gpr(regno)).await
    }

    /// Write a general purpose register.  Writes to `x0` silently
    /// succeed.
    pub async fn write_reg(&mut self, hart: u8, regno: u8, value: u32) -> Result<(), SwdError> {
        self.check_hart(hart)?;
        if regno >= 32 {
            return Err(SwdError::InvalidParam);
        }
        if regno == 0 {
            return Ok(());
        }
        self.require_halted(hart).await?;

        self.abstract_reg_write(regs::gpr(regno), value).await?;
        self.harts[hart as usize].invalidate();
        Ok(())
    }

    /// Read all 32 GPRs into a caller buffer, short-circuiting `x0`
    pub async fn read_all_gprs(&mut self, hart: u8) -> Result<[u32; 32], SwdError> {
        self.require_halted(hart).await?;

        let state = &self.harts[hart as usize];
        if self.cache_enabled && state.cache_valid {
            return Ok(state.cached_gprs);
        }

        let mut gprs = [0u32; 32];
        for regno in 1..32u8 {
            gprs[regno as usize] = self.abstract_reg_read(regs::gpr(regno)).await?;
        }

        if self.cache_enabled {
            // The hart is halted with known state here, so caching is sound
            let state = &mut self.harts[hart as usize];
            state.cached_gprs = gprs;
            state.cache_valid = true;
        }
        Ok(gprs)
    }

    //==========================================================================
    // CSR and PC access
    //==========================================================================

    /// Read a CSR on a halted hart
    pub async fn read_csr(&mut self, hart: u8, csr: u16) -> Result<u32, SwdError> {
        self.require_halted(hart).await?;
        let value = self.read_csr_selected(csr).await?;
        // The progbuf fallback executes from the buffer; drop any cached
        // state for the hart, matching the write path
        self.harts[hart as usize].invalidate();
        Ok(value)
    }

    /// Write a CSR on a halted hart
    pub async fn write_csr(&mut self, hart: u8, csr: u16, value: u32) -> Result<(), SwdError> {
        self.require_halted(hart).await?;
        self.write_csr_selected(csr, value).await?;
        // CSR writes can change execution context
        self.harts[hart as usize].invalidate();
        Ok(())
    }

    /// Read the program counter via the `dpc` CSR
    pub async fn read_pc(&mut self, hart: u8) -> Result<u32, SwdError> {
        self.require_halted(hart).await?;

        if self.cache_enabled {
            if let Some(pc) = self.harts[hart as usize].cached_pc {
                return Ok(pc);
            }
        }

        let pc = self.read_csr_selected(regs::CSR_DPC).await?;
        if self.cache_enabled {
            self.harts[hart as usize].cached_pc = Some(pc);
        }
        Ok(pc)
    }

    /// Write the program counter via the `dpc` CSR, verifying by
    /// read-back.  Whether the new PC sticks across a resume can depend
    /// on target firmware state; the verification catches the common
    /// failure early.
    pub async fn write_pc(&mut self, hart: u8, pc: u32) -> Result<(), SwdError> {
        self.require_halted(hart).await?;

        self.write_csr_selected(regs::CSR_DPC, pc).await?;
        self.harts[hart as usize].invalidate();

        let readback = self.read_csr_selected(regs::CSR_DPC).await?;
        if readback != pc {
            warn!("dpc write did not stick: wrote {pc:#010X}, read {readback:#010X}");
            return Err(SwdError::Verify);
        }

        if self.cache_enabled {
            self.harts[hart as usize].cached_pc = Some(pc);
        }
        Ok(())
    }

    // CSR access with the hart already selected and halted.  Prefers the
    // abstract command; falls back to the program buffer when the DM does
    // not support abstract CSR transfers.
    async fn read_csr_selected(&mut self, csr: u16) -> Result<u32, SwdError> {
        let command = AccessRegisterCommand::transfer32(regs::csr(csr), false);
        match self.try_abstract_command(command).await? {
            None => self.dmi.dmi_read(addr::DATA0).await,
            Some(AbstractCmdErr::NotSupported) => self.read_csr_progbuf(csr).await,
            Some(_) => Err(SwdError::AbstractCmd),
        }
    }

    async fn write_csr_selected(&mut self, csr: u16, value: u32) -> Result<(), SwdError> {
        self.dmi.dmi_write(addr::DATA0, value).await?;
        let command = AccessRegisterCommand::transfer32(regs::csr(csr), true);
        match self.try_abstract_command(command).await? {
            None => Ok(()),
            Some(AbstractCmdErr::NotSupported) => self.write_csr_progbuf(csr, value).await,
            Some(_) => Err(SwdError::AbstractCmd),
        }
    }

    async fn read_csr_progbuf(&mut self, csr: u16) -> Result<u32, SwdError> {
        let saved = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await?;

        let dpc = self.capture_dpc_progbuf().await?;
        let value = if csr == regs::CSR_DPC {
            // The capture snippet already read it, before the buffer's
            // ebreak could redirect it
            dpc
        } else {
            self.setup_progbuf(&[asm::csrr(regs::SCRATCH_S0 as u32, csr as u32)])
                .await?;
            self.abstract_command(AccessRegisterCommand::execute_progbuf())
                .await?;
            self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await?
        };
        self.restore_dpc_progbuf(dpc).await?;

        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), saved)
            .await?;
        Ok(value)
    }

    async fn write_csr_progbuf(&mut self, csr: u16, value: u32) -> Result<(), SwdError> {
        let saved = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await?;

        // For dpc itself the caller's value is the state to leave behind
        let dpc = if csr == regs::CSR_DPC {
            value
        } else {
            self.capture_dpc_progbuf().await?
        };

        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), value)
            .await?;
        self.setup_progbuf(&[asm::csrw(csr as u32, regs::SCRATCH_S0 as u32)])
            .await?;
        self.abstract_command(AccessRegisterCommand::execute_progbuf())
            .await?;

        self.restore_dpc_progbuf(dpc).await?;

        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), saved)
            .await?;
        Ok(())
    }

    // Every postexec run ends in the buffer's ebreak, which re-enters
    // debug mode with dpc pointing into the program buffer.  dpc is
    // therefore captured before a buffer runs and written back after.
    // These two are self-contained (abstract GPR transfers plus the
    // buffer itself) so the CSR fallback paths can use them without
    // going back through the CSR accessors; the csrr runs before the
    // ebreak, which is what makes the capture possible.  Both clobber
    // s0; callers hold the saved copy.
    async fn capture_dpc_progbuf(&mut self) -> Result<u32, SwdError> {
        self.setup_progbuf(&[asm::csrr(regs::SCRATCH_S0 as u32, regs::CSR_DPC as u32)])
            .await?;
        self.abstract_command(AccessRegisterCommand::execute_progbuf())
            .await?;
        self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await
    }

    async fn restore_dpc_progbuf(&mut self, dpc: u32) -> Result<(), SwdError> {
        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), dpc)
            .await?;
        self.setup_progbuf(&[asm::csrw(regs::CSR_DPC as u32, regs::SCRATCH_S0 as u32)])
            .await?;
        self.abstract_command(AccessRegisterCommand::execute_progbuf())
            .await
    }

    //==========================================================================
    // Memory access
    //==========================================================================

    /// Read a 32-bit word from target memory.
    ///
    /// Routed through the program buffer when a hart is known-halted,
    /// otherwise over the system bus.  A running hart is never silently
    /// halted to serve a memory access.
    pub async fn read_mem32(&mut self, address: u32) -> Result<u32, SwdError> {
        self.require_initialized()?;
        check_aligned(address)?;

        match self.halted_hart() {
            Some(hart) => {
                self.select_hart(hart).await?;
                self.progbuf_read_mem32(address).await
            }
            None => self.sba_read_mem32(address).await,
        }
    }

    /// Write a 32-bit word to target memory.  Same routing as
    /// [`Self::read_mem32()`].
    pub async fn write_mem32(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        self.require_initialized()?;
        check_aligned(address)?;

        match self.halted_hart() {
            Some(hart) => {
                self.select_hart(hart).await?;
                self.progbuf_write_mem32(address, value).await
            }
            None => self.sba_write_mem32(address, value).await,
        }
    }

    /// Read a 32-bit word over the system bus, without involving any hart
    pub async fn sba_read_mem32(&mut self, address: u32) -> Result<u32, SwdError> {
        self.require_sba()?;
        check_aligned(address)?;

        // sbreadonaddr kicks the transfer as soon as the address lands
        self.write_sbcs(false, true).await?;
        self.dmi.dmi_write(addr::SBADDRESS0, address).await?;
        self.sba_wait_idle().await?;
        let value = self.dmi.dmi_read(addr::SBDATA0).await?;
        self.sba_check_errors().await?;
        Ok(value)
    }

    /// Write a 32-bit word over the system bus, without involving any hart
    pub async fn sba_write_mem32(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        self.require_sba()?;
        check_aligned(address)?;

        self.write_sbcs(false, false).await?;
        self.dmi.dmi_write(addr::SBADDRESS0, address).await?;
        // Data writes are posted; the SBCS poll below observes completion
        self.dmi.dmi_write(addr::SBDATA0, value).await?;
        self.sba_check_errors().await
    }

    /// Read consecutive words over the system bus with address
    /// auto-increment
    pub async fn sba_read_mem32_bulk(
        &mut self,
        address: u32,
        buf: &mut [u32],
    ) -> Result<(), SwdError> {
        self.require_sba()?;
        check_aligned(address)?;
        if buf.is_empty() {
            return Ok(());
        }

        self.write_sbcs(true, true).await?;
        self.dmi.dmi_write(addr::SBADDRESS0, address).await?;

        let last = buf.len() - 1;
        for (index, slot) in buf.iter_mut().enumerate() {
            self.sba_wait_idle().await?;
            if index == last {
                // Stop the read-on-data stream before draining the final
                // word, or the bus would fetch one word past the buffer
                self.write_sbcs(true, false).await?;
            }
            *slot = self.dmi.dmi_read(addr::SBDATA0).await?;
        }
        self.sba_check_errors().await
    }

    /// Write consecutive words over the system bus with address
    /// auto-increment
    pub async fn sba_write_mem32_bulk(
        &mut self,
        address: u32,
        buf: &[u32],
    ) -> Result<(), SwdError> {
        self.require_sba()?;
        check_aligned(address)?;
        if buf.is_empty() {
            return Ok(());
        }

        self.write_sbcs(true, false).await?;
        self.dmi.dmi_write(addr::SBADDRESS0, address).await?;
        for &word in buf {
            self.sba_wait_idle().await?;
            self.dmi.dmi_write(addr::SBDATA0, word).await?;
        }
        self.sba_check_errors().await
    }

    // Hart-mediated single word read: lw s1, 0(s0) through the program
    // buffer, with the scratch pair and dpc saved and restored - the
    // buffer's ebreak leaves dpc pointing into the program buffer.
    async fn progbuf_read_mem32(&mut self, address: u32) -> Result<u32, SwdError> {
        let s0 = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await?;
        let s1 = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S1)).await?;
        let dpc = self.read_csr_selected(regs::CSR_DPC).await?;

        self.setup_progbuf(&[asm::lw(
            0,
            regs::SCRATCH_S0 as u32,
            asm::WIDTH_32,
            regs::SCRATCH_S1 as u32,
        )])
        .await?;

        // Transfer the address into s0 and run the buffer in one command
        self.dmi.dmi_write(addr::DATA0, address).await?;
        let mut command = AccessRegisterCommand::transfer32(regs::gpr(regs::SCRATCH_S0), true);
        command.set_postexec(true);
        self.abstract_command(command).await?;

        let value = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S1)).await?;

        self.write_csr_selected(regs::CSR_DPC, dpc).await?;
        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), s0)
            .await?;
        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S1), s1)
            .await?;
        self.invalidate_selected();
        Ok(value)
    }

    // Hart-mediated single word write: sw s1, 0(s0), with the same
    // scratch and dpc handling as the read path
    async fn progbuf_write_mem32(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        let s0 = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S0)).await?;
        let s1 = self.abstract_reg_read(regs::gpr(regs::SCRATCH_S1)).await?;
        let dpc = self.read_csr_selected(regs::CSR_DPC).await?;

        self.setup_progbuf(&[asm::sw(
            0,
            regs::SCRATCH_S0 as u32,
            asm::WIDTH_32,
            regs::SCRATCH_S1 as u32,
        )])
        .await?;

        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), address)
            .await?;

        // Transfer the data into s1 and run the buffer in one command
        self.dmi.dmi_write(addr::DATA0, value).await?;
        let mut command = AccessRegisterCommand::transfer32(regs::gpr(regs::SCRATCH_S1), true);
        command.set_postexec(true);
        self.abstract_command(command).await?;

        self.write_csr_selected(regs::CSR_DPC, dpc).await?;
        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S0), s0)
            .await?;
        self.abstract_reg_write(regs::gpr(regs::SCRATCH_S1), s1)
            .await?;
        self.invalidate_selected();
        Ok(())
    }

    //==========================================================================
    // Abstract command plumbing
    //==========================================================================

    // Run an abstract command.  Ok(None) is success; Ok(Some(kind)) means
    // the command itself failed and cmderr has been cleared; Err is a
    // transport failure.
    async fn try_abstract_command(
        &mut self,
        command: AccessRegisterCommand,
    ) -> Result<Option<AbstractCmdErr>, SwdError> {
        self.dmi.dmi_write(addr::COMMAND, command.0).await?;

        let deadline = Instant::now() + ABSTRACT_TIMEOUT;
        let status = loop {
            let status = Abstractcs(self.dmi.dmi_read(addr::ABSTRACTCS).await?);
            if !status.busy() {
                break status;
            }
            if Instant::now() > deadline {
                warn!("Abstract command stuck busy");
                return Err(SwdError::Timeout);
            }
            Timer::after_micros(50).await;
        };

        if let Some(kind) = AbstractCmdErr::from_cmderr(status.cmderr()) {
            self.clear_cmderr().await?;
            debug!("Abstract command {:#010X} failed: {kind:?}", command.0);
            return Ok(Some(kind));
        }
        Ok(None)
    }

    async fn abstract_command(&mut self, command: AccessRegisterCommand) -> Result<(), SwdError> {
        match self.try_abstract_command(command).await? {
            None => Ok(()),
            Some(_) => Err(SwdError::AbstractCmd),
        }
    }

    async fn abstract_reg_read(&mut self, regno: u16) -> Result<u32, SwdError> {
        self.abstract_command(AccessRegisterCommand::transfer32(regno, false))
            .await?;
        self.dmi.dmi_read(addr::DATA0).await
    }

    async fn abstract_reg_write(&mut self, regno: u16, value: u32) -> Result<(), SwdError> {
        self.dmi.dmi_write(addr::DATA0, value).await?;
        self.abstract_command(AccessRegisterCommand::transfer32(regno, true))
            .await
    }

    // cmderr is write-1-to-clear
    async fn clear_cmderr(&mut self) -> Result<(), SwdError> {
        let mut clear = Abstractcs(0);
        clear.set_cmderr(0x7);
        self.dmi.dmi_write(addr::ABSTRACTCS, clear.0).await
    }

    // Load a snippet into the program buffer, appending an ebreak where
    // the hardware does not provide an implicit one.  Skipped when the
    // buffer already holds the same snippet.
    async fn setup_progbuf(&mut self, program: &[u32]) -> Result<(), SwdError> {
        let required = program.len() + usize::from(!self.impebreak);
        if required > self.progbuf_size as usize {
            debug!("Program of {} words exceeds progbuf", program.len());
            return Err(SwdError::InvalidState);
        }

        if self.progbuf_cache_len == program.len()
            && program == &self.progbuf_cache[..program.len()]
        {
            return Ok(());
        }

        for (index, &word) in program.iter().enumerate() {
            self.dmi
                .dmi_write(addr::PROGBUF0 + index as u8, word)
                .await?;
        }
        if !self.impebreak || program.len() < self.progbuf_size as usize {
            self.dmi
                .dmi_write(addr::PROGBUF0 + program.len() as u8, asm::EBREAK)
                .await?;
        }

        self.progbuf_cache[..program.len()].copy_from_slice(program);
        self.progbuf_cache_len = program.len();
        Ok(())
    }

    //==========================================================================
    // SBA plumbing
    //==========================================================================

    fn require_sba(&self) -> Result<(), SwdError> {
        self.require_initialized()?;
        if !self.sba_supported {
            debug!("System bus access not supported by this DM");
            return Err(SwdError::InvalidState);
        }
        Ok(())
    }

    async fn write_sbcs(&mut self, autoincrement: bool, read_stream: bool) -> Result<(), SwdError> {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(SBACCESS_32);
        sbcs.set_sbautoincrement(autoincrement);
        sbcs.set_sbreadonaddr(read_stream);
        sbcs.set_sbreadondata(autoincrement && read_stream);
        self.dmi.dmi_write(addr::SBCS, sbcs.0).await
    }

    async fn sba_wait_idle(&mut self) -> Result<Sbcs, SwdError> {
        let deadline = Instant::now() + SBA_TIMEOUT;
        loop {
            let sbcs = Sbcs(self.dmi.dmi_read(addr::SBCS).await?);
            if !sbcs.sbbusy() {
                return Ok(sbcs);
            }
            if Instant::now() > deadline {
                warn!("System bus stuck busy");
                return Err(SwdError::Timeout);
            }
            Timer::after_micros(10).await;
        }
    }

    async fn sba_check_errors(&mut self) -> Result<(), SwdError> {
        let sbcs = self.sba_wait_idle().await?;
        if sbcs.sberror() != 0 || sbcs.sbbusyerror() {
            warn!("SBA error {} busyerror {}", sbcs.sberror(), sbcs.sbbusyerror());
            let mut clear = Sbcs(0);
            clear.set_sberror(0x7);
            clear.set_sbbusyerror(true);
            self.dmi.dmi_write(addr::SBCS, clear.0).await?;
            return Err(SwdError::Bus);
        }
        Ok(())
    }

    //==========================================================================
    // Shared helpers
    //==========================================================================

    fn check_hart(&self, hart: u8) -> Result<(), SwdError> {
        if hart >= NUM_HARTS {
            return Err(SwdError::InvalidParam);
        }
        Ok(())
    }

    fn require_initialized(&self) -> Result<(), SwdError> {
        if !self.initialized {
            return Err(SwdError::NotInitialized);
        }
        Ok(())
    }

    // Refresh the halt state if unknown, route hartsel, and require the
    // hart to be halted
    async fn require_halted(&mut self, hart: u8) -> Result<(), SwdError> {
        self.check_hart(hart)?;
        self.require_initialized()?;

        if !self.harts[hart as usize].halt_state_known {
            self.is_halted(hart).await?;
        } else {
            self.select_hart(hart).await?;
        }

        if !self.harts[hart as usize].halted {
            debug!("Hart {hart} is not halted");
            return Err(SwdError::NotHalted);
        }
        Ok(())
    }

    // Drop cached register state for the hart the DM currently routes
    // to, after anything executed from the program buffer
    fn invalidate_selected(&mut self) {
        if let Some(hart) = self.selected_hart {
            self.harts[hart as usize].invalidate();
        }
    }

    // Route subsequent DM operations to a hart, eliding the DMCONTROL
    // write when it is already selected
    async fn select_hart(&mut self, hart: u8) -> Result<(), SwdError> {
        if self.selected_hart != Some(hart) {
            self.dmi
                .dmi_write(addr::DMCONTROL, Dmcontrol::select_hart(hart).0)
                .await?;
            self.selected_hart = Some(hart);
        }
        Ok(())
    }

    // The lowest hart known to be halted, used by the memory routing
    // policy
    fn halted_hart(&self) -> Option<u8> {
        self.harts
            .iter()
            .position(|state| state.halt_state_known && state.halted)
            .map(|index| index as u8)
    }

    async fn poll_dmstatus<F>(&mut self, predicate: F, timeout: Duration) -> Result<Dmstatus, SwdError>
    where
        F: Fn(&Dmstatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let status = Dmstatus(self.dmi.dmi_read(addr::DMSTATUS).await?);
            if predicate(&status) {
                return Ok(status);
            }
            if Instant::now() > deadline {
                return Err(SwdError::Timeout);
            }
            Timer::after_micros(100).await;
        }
    }
}

fn check_aligned(address: u32) -> Result<(), SwdError> {
    if address & 0x3 != 0 {
        debug!("Unaligned word access at {address:#010X}");
        return Err(SwdError::Alignment);
    }
    Ok(())
}
