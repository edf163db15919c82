// Copyright (C) 2025 piolink contributors
//
// MIT License

//! Target session object
//!
//! A [`Target`] is one debug session: it exclusively owns a PIO state
//! machine slot and the two SWD pins, carries the layered protocol stack,
//! and records error context for diagnostics.  Slot ownership is tracked
//! in a process-wide registry reflecting the hardware reality of 2 PIO
//! blocks x 4 state machines.

use core::cell::RefCell;
use core::fmt;
use core::fmt::Write as _;
use core::result::Result;
use core::sync::atomic::{AtomicU32, Ordering};

use alloc::format;
use alloc::string::String;
use critical_section::Mutex;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{PIOExt, StateMachineIndex, UninitStateMachine, PIO};

use crate::dap::DapInterface;
use crate::dm::DebugModule;
use crate::dmi::DmiTransport;
use crate::engine::SwdEngine;
use crate::trace::TraceRecord;
use crate::SwdError;
use piolink_core::slots::{PioBlock, Slot, SlotMap, SlotUsage};

// Device-safe SWCLK range in kHz
const FREQ_MIN_KHZ: u32 = 100;
const FREQ_MAX_KHZ: u32 = 2000;

// Error detail strings are capped at this many bytes
const ERROR_DETAIL_MAX: usize = 128;

// One registry for the whole process: 2 PIO blocks x 4 state machines
static SLOT_REGISTRY: Mutex<RefCell<SlotMap>> = Mutex::new(RefCell::new(SlotMap::new()));

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

/// Snapshot of which PIO slots are owned by debug sessions
pub fn resource_usage() -> SlotUsage {
    critical_section::with(|cs| SLOT_REGISTRY.borrow_ref(cs).usage())
}

/// Configuration for creating a [`Target`]
///
/// Pins must be supplied; everything else has a sensible default: 1000
/// kHz SWCLK, register caching on, 5 WAIT retries, 150 MHz system clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// GPIO pin number for SWCLK
    pub pin_swclk: u8,
    /// GPIO pin number for SWDIO
    pub pin_swdio: u8,
    /// SWCLK frequency in kHz (100-2000)
    pub freq_khz: u32,
    /// Enable the per-hart register cache
    pub enable_caching: bool,
    /// Number of retries on WAIT ACK
    pub wait_retries: u32,
    /// Host system clock in kHz, for the PIO clock divider
    pub sys_clk_khz: u32,
}

impl Config {
    pub fn new(pin_swclk: u8, pin_swdio: u8) -> Self {
        Self {
            pin_swclk,
            pin_swdio,
            freq_khz: 1000,
            enable_caching: true,
            wait_retries: 5,
            sys_clk_khz: 150_000,
        }
    }
}

/// One SWD debug session against an RP2350 RISC-V target
///
/// Create with [`Target::new()`], passing the PIO block and state machine
/// the session should own.  The pins must already be assigned to that PIO
/// block's function by the caller, with a pull-up on SWDIO so the line
/// idles high across turnarounds.  Creation claims the slot and prepares
/// the line engine but does not touch the target; call
/// [`Target::connect()`] and then [`Target::dm_init()`] before any debug
/// operation.
///
/// ```rust,ignore
/// let (mut pio0, sm0, ..) = pac.PIO0.split(&mut pac.RESETS);
/// let config = Config::new(2, 3);
/// let mut target = Target::new(config, &mut pio0, sm0, PioBlock::Pio0)?;
/// target.connect().await?;
/// target.dm_init().await?;
/// target.halt(0).await?;
/// ```
pub struct Target<P: PIOExt, SM: StateMachineIndex> {
    dm: DebugModule<P, SM>,
    slot: Slot,
    pin_swclk: u8,
    pin_swdio: u8,
    last_error: Option<SwdError>,
    error_detail: String,
}

impl<P: PIOExt, SM: StateMachineIndex> Target<P, SM> {
    /// Create a debug session.
    ///
    /// Validates the configuration, claims the `(block, state machine)`
    /// slot in the process-wide registry, and starts the line engine.
    ///
    /// Returns:
    /// - `Err(SwdError::InvalidConfig)`: pins not distinct or frequency
    ///   out of the 100-2000 kHz range.
    /// - `Err(SwdError::ResourceBusy)`: the slot is owned by another
    ///   session.
    /// - `Err(SwdError::NoMemory)`: no PIO instruction space left.
    pub fn new(
        config: Config,
        pio: &mut PIO<P>,
        sm: UninitStateMachine<(P, SM)>,
        block: PioBlock,
    ) -> Result<Self, SwdError> {
        if config.pin_swclk == config.pin_swdio {
            warn!("SWCLK and SWDIO must be distinct pins");
            return Err(SwdError::InvalidConfig);
        }
        if !(FREQ_MIN_KHZ..=FREQ_MAX_KHZ).contains(&config.freq_khz) {
            warn!("SWCLK frequency {} kHz out of range", config.freq_khz);
            return Err(SwdError::InvalidConfig);
        }

        let slot = Slot::new(block, SM::id() as u8).ok_or(SwdError::InvalidConfig)?;
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let claimed =
            critical_section::with(|cs| SLOT_REGISTRY.borrow_ref_mut(cs).claim(slot, session));
        if !claimed {
            warn!("{slot} already in use");
            return Err(SwdError::ResourceBusy);
        }

        let engine = SwdEngine::new(
            pio,
            sm,
            config.pin_swclk,
            config.pin_swdio,
            config.freq_khz,
            config.sys_clk_khz,
            config.wait_retries,
        );
        let engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                critical_section::with(|cs| SLOT_REGISTRY.borrow_ref_mut(cs).release(slot));
                return Err(e);
            }
        };

        let dap = DapInterface::new(engine);
        let dmi = DmiTransport::new(dap);
        let dm = DebugModule::new(dmi, config.enable_caching);

        info!(
            "Created target: {slot}, pins SWCLK={} SWDIO={}",
            config.pin_swclk, config.pin_swdio
        );

        Ok(Self {
            dm,
            slot,
            pin_swclk: config.pin_swclk,
            pin_swdio: config.pin_swdio,
            last_error: None,
            error_detail: String::new(),
        })
    }

    /// The slot this session owns
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Access the Debug Module layer for operations beyond this API
    pub fn dm(&mut self) -> &mut DebugModule<P, SM> {
        &mut self.dm
    }

    //==========================================================================
    // Connection management
    //==========================================================================

    /// Connect to the target: dormant wake, IDCODE, debug power-up
    pub async fn connect(&mut self) -> Result<(), SwdError> {
        match self.dap().connect().await {
            Ok(idcode) => {
                self.clear_error();
                info!("Connected: IDCODE {idcode}");
                Ok(())
            }
            Err(e) => Err(self.record_error(e, format_args!("connect"))),
        }
    }

    /// Disconnect from the target, leaving the pins released
    pub async fn disconnect(&mut self) {
        self.dap().disconnect().await;
        self.clear_error();
    }

    pub fn is_connected(&self) -> bool {
        self.dm.dmi_ref().dap_ref().is_connected()
    }

    /// The IDCODE read at connect time
    pub fn read_idcode(&mut self) -> Result<u32, SwdError> {
        match self.dm.dmi_ref().dap_ref().idcode() {
            Some(idcode) => {
                self.clear_error();
                Ok(idcode.data())
            }
            None => Err(self.record_error(SwdError::NotConnected, format_args!("read_idcode"))),
        }
    }

    /// Human-readable session summary, or `None` when not connected
    pub fn target_info(&mut self) -> Option<String> {
        let idcode = self.dm.dmi_ref().dap_ref().idcode()?;
        let freq_khz = self.dap().engine().frequency_khz();
        Some(format!(
            "IDCODE: {idcode}, {}, SWCLK={} SWDIO={}, {} kHz",
            self.slot, self.pin_swclk, self.pin_swdio, freq_khz
        ))
    }

    //==========================================================================
    // Frequency control
    //==========================================================================

    /// Change the SWCLK frequency.  Permitted while connected; values
    /// outside the device-safe range are clamped.
    pub fn set_frequency(&mut self, freq_khz: u32) -> Result<(), SwdError> {
        if freq_khz == 0 {
            return Err(self.record_error(SwdError::InvalidParam, format_args!("set_frequency 0")));
        }

        let clamped = freq_khz.clamp(FREQ_MIN_KHZ, FREQ_MAX_KHZ);
        if clamped != freq_khz {
            warn!("SWCLK {freq_khz} kHz clamped to {clamped} kHz");
        }
        self.dap().engine().set_frequency(clamped);
        self.clear_error();
        Ok(())
    }

    /// Current SWCLK frequency in kHz
    pub fn frequency(&mut self) -> u32 {
        self.dap().engine().frequency_khz()
    }

    //==========================================================================
    // Debug Module operations
    //==========================================================================

    /// Initialize the Debug Module.  Requires a connection.
    pub async fn dm_init(&mut self) -> Result<(), SwdError> {
        if !self.dap().is_connected() {
            return Err(self.record_error(SwdError::NotConnected, format_args!("dm_init")));
        }
        let result = self.dm.init().await;
        self.finish(result, format_args!("dm_init"))
    }

    /// Halt a hart.  `AlreadyHalted` is informational.
    pub async fn halt(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.halt(hart).await;
        self.finish(result, format_args!("halt hart {hart}"))
    }

    /// Resume a halted hart
    pub async fn resume(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.resume(hart).await;
        self.finish(result, format_args!("resume hart {hart}"))
    }

    /// Single-step a halted hart
    pub async fn step(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.step(hart).await;
        self.finish(result, format_args!("step hart {hart}"))
    }

    /// Reset the target, optionally halting the hart at its reset vector
    pub async fn reset(&mut self, hart: u8, halt_after: bool) -> Result<(), SwdError> {
        let result = self.dm.reset(hart, halt_after).await;
        self.finish(result, format_args!("reset hart {hart}"))
    }

    /// Query whether a hart is halted
    pub async fn is_halted(&mut self, hart: u8) -> Result<bool, SwdError> {
        let result = self.dm.is_halted(hart).await;
        self.finish(result, format_args!("halt status hart {hart}"))
    }

    /// Read GPR `x<regno>` of a halted hart
    pub async fn read_reg(&mut self, hart: u8, regno: u8) -> Result<u32, SwdError> {
        let result = self.dm.read_reg(hart, regno).await;
        self.finish(result, format_args!("read x{regno} hart {hart}"))
    }

    /// Write GPR `x<regno>` of a halted hart
    pub async fn write_reg(&mut self, hart: u8, regno: u8, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_reg(hart, regno, value).await;
        self.finish(result, format_args!("write x{regno} hart {hart}"))
    }

    /// Read all 32 GPRs of a halted hart
    pub async fn read_all_gprs(&mut self, hart: u8) -> Result<[u32; 32], SwdError> {
        let result = self.dm.read_all_gprs(hart).await;
        self.finish(result, format_args!("read GPRs hart {hart}"))
    }

    /// Read a CSR of a halted hart
    pub async fn read_csr(&mut self, hart: u8, csr: u16) -> Result<u32, SwdError> {
        let result = self.dm.read_csr(hart, csr).await;
        self.finish(result, format_args!("read csr {csr:#05X} hart {hart}"))
    }

    /// Write a CSR of a halted hart
    pub async fn write_csr(&mut self, hart: u8, csr: u16, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_csr(hart, csr, value).await;
        self.finish(result, format_args!("write csr {csr:#05X} hart {hart}"))
    }

    /// Read the PC of a halted hart
    pub async fn read_pc(&mut self, hart: u8) -> Result<u32, SwdError> {
        let result = self.dm.read_pc(hart).await;
        self.finish(result, format_args!("read pc hart {hart}"))
    }

    /// Write the PC of a halted hart, verified by read-back
    pub async fn write_pc(&mut self, hart: u8, pc: u32) -> Result<(), SwdError> {
        let result = self.dm.write_pc(hart, pc).await;
        self.finish(result, format_args!("write pc {pc:#010X} hart {hart}"))
    }

    /// Read a 32-bit word from target memory
    pub async fn read_mem32(&mut self, address: u32) -> Result<u32, SwdError> {
        let result = self.dm.read_mem32(address).await;
        self.finish(result, format_args!("read mem {address:#010X}"))
    }

    /// Write a 32-bit word to target memory
    pub async fn write_mem32(&mut self, address: u32, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_mem32(address, value).await;
        self.finish(result, format_args!("write mem {address:#010X}"))
    }

    /// Read consecutive words from target memory over the system bus
    pub async fn read_mem32_bulk(
        &mut self,
        address: u32,
        buf: &mut [u32],
    ) -> Result<(), SwdError> {
        let result = self.dm.sba_read_mem32_bulk(address, buf).await;
        self.finish(result, format_args!("bulk read {address:#010X}"))
    }

    /// Write consecutive words to target memory over the system bus
    pub async fn write_mem32_bulk(&mut self, address: u32, buf: &[u32]) -> Result<(), SwdError> {
        let result = self.dm.sba_write_mem32_bulk(address, buf).await;
        self.finish(result, format_args!("bulk write {address:#010X}"))
    }

    /// Trace instructions on a halted hart; see
    /// [`DebugModule::trace()`] for the callback contract
    pub async fn trace<F>(
        &mut self,
        hart: u8,
        max_instructions: u32,
        callback: F,
        capture_regs: bool,
    ) -> Result<u32, SwdError>
    where
        F: FnMut(&TraceRecord) -> bool,
    {
        let result = self.dm.trace(hart, max_instructions, callback, capture_regs).await;
        self.finish(result, format_args!("trace hart {hart}"))
    }

    //==========================================================================
    // Error context
    //==========================================================================

    /// The error recorded by the most recent operation, if any
    pub fn last_error(&self) -> Option<SwdError> {
        self.last_error
    }

    /// Human-readable context for the last error (empty when none)
    pub fn last_error_detail(&self) -> &str {
        &self.error_detail
    }

    fn dap(&mut self) -> &mut DapInterface<P, SM> {
        self.dm.dmi().dap()
    }

    fn finish<T>(&mut self, result: Result<T, SwdError>, context: fmt::Arguments<'_>) -> Result<T, SwdError> {
        match result {
            Ok(value) => {
                self.clear_error();
                Ok(value)
            }
            Err(e) => Err(self.record_error(e, context)),
        }
    }

    fn record_error(&mut self, error: SwdError, context: fmt::Arguments<'_>) -> SwdError {
        self.last_error = Some(error);
        self.error_detail.clear();
        let _ = write!(self.error_detail, "{context}");
        // Detail strings are ASCII; cap at the fixed buffer size
        self.error_detail.truncate(ERROR_DETAIL_MAX);

        if !error.is_informational() {
            warn!("{}: {}", error.as_str(), self.error_detail);
        }
        error
    }

    fn clear_error(&mut self) {
        self.last_error = None;
        self.error_detail.clear();
    }
}

impl<P: PIOExt, SM: StateMachineIndex> Drop for Target<P, SM> {
    fn drop(&mut self) {
        // Power down and release the line if a connection is still up,
        // then return the slot to the registry
        self.dap().shutdown();
        critical_section::with(|cs| SLOT_REGISTRY.borrow_ref_mut(cs).release(self.slot));
        info!("Destroyed target: {}", self.slot);
    }
}
