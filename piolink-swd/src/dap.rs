// Copyright (C) 2025 piolink contributors
//
// MIT License

//! DAP session layer
//!
//! Owns the connection sequence (dormant wake, line reset, IDCODE,
//! power-up handshake), the DP SELECT cache, and typed DP register access.
//! AP reads are posted: the engine issues the AP read and then fetches the
//! actual value from DP RDBUFF; callers never see the stale first word.

use core::result::Result;
use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{PIOExt, StateMachineIndex};

use crate::engine::SwdEngine;
use crate::SwdError;
use piolink_core::arm::dp::{
    Abort, AbortRegister, CtrlStat, CtrlStatRegister, IdCode, IdCodeRegister, RdBuffRegister,
    Select, SelectRegister,
};
use piolink_core::arm::register::{ReadableRegister, RegisterDescriptor, WritableRegister};
use piolink_core::arm::request::SwdOp;

// Time allowed for the CTRL/STAT power-up acknowledges
const POWER_UP_TIMEOUT: Duration = Duration::from_millis(100);

/// DAP session object
///
/// Wraps the [`SwdEngine`] with ADIv5 session state.  Used by
/// [`crate::DmiTransport`]; most applications go through [`crate::Target`].
pub struct DapInterface<P: PIOExt, SM: StateMachineIndex> {
    engine: SwdEngine<P, SM>,
    idcode: Option<IdCode>,
    powered: bool,

    // Last-written SELECT.  None means unknown (start of day, or after an
    // ABORT), which forces the next AP access to rewrite it.
    select: Option<Select>,
}

impl<P: PIOExt, SM: StateMachineIndex> DapInterface<P, SM> {
    pub fn new(engine: SwdEngine<P, SM>) -> Self {
        Self {
            engine,
            idcode: None,
            powered: false,
            select: None,
        }
    }

    /// Access the underlying line engine
    pub fn engine(&mut self) -> &mut SwdEngine<P, SM> {
        &mut self.engine
    }

    pub fn is_connected(&self) -> bool {
        self.idcode.is_some()
    }

    pub fn idcode(&self) -> Option<IdCode> {
        self.idcode
    }

    /// Connect to the target DP.
    ///
    /// Performs the full sequence: dormant wake, line reset, IDCODE read
    /// and validation, sticky-flag clear, and debug/system power-up with
    /// acknowledge polling.
    ///
    /// Returns:
    /// - `Ok(IdCode)`: the validated DPIDR of the target.
    /// - `Err(SwdError)`: `Protocol` for an undriven or invalid IDCODE,
    ///   `Timeout` if the power-up acknowledges never arrive, or any
    ///   transport error.
    pub async fn connect(&mut self) -> Result<IdCode, SwdError> {
        trace!("Exec:  Connect");
        self.reset_session_state();

        // Start from a known line state
        self.engine.swdio_drive(false);
        Timer::after_micros(500).await;

        // Park any JTAG-capable DP in dormant state, then wake into SWD
        self.engine.line_reset();
        self.engine.jtag_to_dormant();
        Timer::after_micros(100).await;
        self.engine.dormant_to_swd();
        self.engine.line_reset();
        Timer::after_micros(100).await;

        // IDCODE read confirms the DP is awake and driving the line
        let raw = self.engine.transaction(SwdOp::DpRead(IdCodeRegister::ADDRESS), 0)?;
        let idcode = IdCode::from(raw);
        if !idcode.is_valid() {
            warn!("Invalid IDCODE {idcode} - target not responding");
            return Err(SwdError::Protocol);
        }
        debug!("Value: IDCODE {idcode}");

        // Clear any stale sticky flags, set a known SELECT
        self.engine
            .transaction(SwdOp::DpWrite(AbortRegister::ADDRESS), Abort::clear_all().into())?;
        self.update_select(Select::default()).await?;

        // Request debug and system power
        let mut ctrl_stat = CtrlStat::default();
        ctrl_stat.set_cdbgpwrupreq(true);
        ctrl_stat.set_csyspwrupreq(true);
        self.write_dp_register(CtrlStatRegister, ctrl_stat).await?;

        // Poll for both acknowledges
        let deadline = Instant::now() + POWER_UP_TIMEOUT;
        loop {
            let status: CtrlStat = self.read_dp_register(CtrlStatRegister).await?;
            if status.cdbgpwrupack() && status.csyspwrupack() {
                break;
            }
            if Instant::now() > deadline {
                warn!("Debug domain power up timed out: {status}");
                return Err(SwdError::Timeout);
            }
            Timer::after_micros(100).await;
        }

        debug!("OK:    Debug domain powered up");
        self.powered = true;
        self.idcode = Some(idcode);
        Ok(idcode)
    }

    /// Disconnect from the target: drop the power-up requests, reset the
    /// line, and release SWDIO to an input.
    pub async fn disconnect(&mut self) {
        trace!("Exec:  Disconnect");
        if self.powered {
            // Best effort - the target may already be gone
            let _ = self
                .write_dp_register(CtrlStatRegister, CtrlStat::default())
                .await;
        }
        self.engine.line_reset();
        self.engine.release_bus();
        self.reset_session_state();
    }

    // Synchronous teardown for drop paths: no delays, no polling.
    pub(crate) fn shutdown(&mut self) {
        if self.powered {
            let _ = self
                .engine
                .transaction(SwdOp::DpWrite(CtrlStatRegister::ADDRESS), 0);
        }
        self.engine.line_reset();
        self.engine.release_bus();
        self.reset_session_state();
    }

    fn reset_session_state(&mut self) {
        self.idcode = None;
        self.powered = false;
        self.select = None;
    }

    /// Read a Debug Port register.
    pub async fn read_dp_register<R>(&mut self, _reg: R) -> Result<R::Value, SwdError>
    where
        R: ReadableRegister,
        R::Value: From<u32>,
    {
        let raw = self.transact(SwdOp::DpRead(R::ADDRESS), 0).await?;
        Ok(R::from_raw(raw))
    }

    /// Write a Debug Port register.
    pub async fn write_dp_register<R>(&mut self, _reg: R, value: R::Value) -> Result<(), SwdError>
    where
        R: WritableRegister,
        u32: From<R::Value>,
    {
        self.transact(SwdOp::DpWrite(R::ADDRESS), R::to_raw(value))
            .await?;
        Ok(())
    }

    /// Read an Access Port register.
    ///
    /// Handles the DP SELECT update (elided when the cached value already
    /// matches) and the posted-read RDBUFF fetch.
    pub async fn read_ap(&mut self, apsel: u8, addr: u8) -> Result<u32, SwdError> {
        self.require_powered()?;
        self.ensure_select(apsel, addr).await?;

        // The AP read is posted; this first result is stale
        let _ = self.transact(SwdOp::ApRead(addr), 0).await?;
        self.transact(SwdOp::DpRead(RdBuffRegister::ADDRESS), 0).await
    }

    /// Write an Access Port register.
    pub async fn write_ap(&mut self, apsel: u8, addr: u8, value: u32) -> Result<(), SwdError> {
        self.require_powered()?;
        self.ensure_select(apsel, addr).await?;
        self.transact(SwdOp::ApWrite(addr), value).await?;
        Ok(())
    }

    fn require_powered(&self) -> Result<(), SwdError> {
        if !self.powered {
            debug!("AP access before debug power up");
            return Err(SwdError::NotConnected);
        }
        Ok(())
    }

    // Write SELECT only when the required (apsel, bank) differs from the
    // cached triple.
    async fn ensure_select(&mut self, apsel: u8, addr: u8) -> Result<(), SwdError> {
        let mut required = Select::from_parts(apsel, 0, false);
        required.set_apbanksel_from_addr(addr);

        if self.select != Some(required) {
            trace!("Exec:  Update DP SELECT {required}");
            self.update_select(required).await?;
        }
        Ok(())
    }

    async fn update_select(&mut self, select: Select) -> Result<(), SwdError> {
        self.transact(SwdOp::DpWrite(SelectRegister::ADDRESS), select.into())
            .await?;
        self.select = Some(select);
        Ok(())
    }

    // One engine transaction with the session's fault handling on top.
    async fn transact(&mut self, op: SwdOp, data: u32) -> Result<u32, SwdError> {
        match self.engine.transaction(op, data) {
            Ok(value) => Ok(value),
            Err(error) if error.cleared_sticky() => Err(self.recover(error)),
            Err(error) => Err(error),
        }
    }

    // After FAULT (or a parity/protocol/wait failure), classify via
    // CTRL/STAT where possible and clear the sticky flags with ABORT.
    // The operation itself is not retried.  ABORT invalidates the SELECT
    // cache.
    fn recover(&mut self, error: SwdError) -> SwdError {
        let abort = if error == SwdError::Fault {
            match self.engine.transaction(SwdOp::DpRead(CtrlStatRegister::ADDRESS), 0) {
                Ok(raw) => {
                    let status = CtrlStat::from(raw);
                    warn!(
                        "FAULT: CTRL/STAT {status} stickyerr={} stickyorun={} wdataerr={}",
                        status.stickyerr(),
                        status.stickyorun(),
                        status.wdataerr()
                    );
                    status.clear_bits()
                }
                Err(_) => Abort::clear_all(),
            }
        } else {
            warn!("Clearing sticky flags after {error}");
            Abort::clear_all()
        };

        let _ = self
            .engine
            .transaction(SwdOp::DpWrite(AbortRegister::ADDRESS), abort.into());
        self.select = None;
        error
    }
}
