// Copyright (C) 2025 piolink contributors
//
// MIT License

//! DMI transport
//!
//! Packs Debug Module Interface operations into accesses to the RP2350's
//! dedicated RISC-V Access Port and polls the returned operation status
//! until the interface is quiescent.  See `piolink_core::riscv::dmi` for
//! the frame layout.

use core::result::Result;
use embassy_time::Timer;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{PIOExt, StateMachineIndex};

use crate::dap::DapInterface;
use crate::SwdError;
use piolink_core::riscv::dmi::{ap, DmiFrame, DmiOp, DmiStatus, DEFAULT_ABITS};
use piolink_core::riscv::DMI_APSEL;

// Polls of a busy DMI before giving up
const DMI_BUSY_RETRIES: u32 = 32;

// Consecutive busy responses after which we hint at a slower SWCLK
const DMI_BUSY_HINT_THRESHOLD: u32 = 8;

/// Debug Module Interface transport over the RISC-V Access Port
pub struct DmiTransport<P: PIOExt, SM: StateMachineIndex> {
    dap: DapInterface<P, SM>,
    abits: u32,
}

impl<P: PIOExt, SM: StateMachineIndex> DmiTransport<P, SM> {
    pub fn new(dap: DapInterface<P, SM>) -> Self {
        Self {
            dap,
            abits: DEFAULT_ABITS,
        }
    }

    /// Access the underlying DAP session
    pub fn dap(&mut self) -> &mut DapInterface<P, SM> {
        &mut self.dap
    }

    /// Shared access to the underlying DAP session
    pub fn dap_ref(&self) -> &DapInterface<P, SM> {
        &self.dap
    }

    /// DMI address width in use
    pub fn abits(&self) -> u32 {
        self.abits
    }

    /// Set the DMI address width once discovered at DM init
    pub fn set_abits(&mut self, abits: u32) {
        self.abits = abits;
    }

    /// Read a Debug Module register
    pub async fn dmi_read(&mut self, addr: u8) -> Result<u32, SwdError> {
        let value = self.dmi_exec(addr as u32, 0, DmiOp::Read).await?;
        trace!("Value: DMI 0x{addr:02X} = {value:#010X}");
        Ok(value)
    }

    /// Write a Debug Module register
    pub async fn dmi_write(&mut self, addr: u8, value: u32) -> Result<(), SwdError> {
        trace!("Exec:  DMI 0x{addr:02X} <- {value:#010X}");
        self.dmi_exec(addr as u32, value, DmiOp::Write).await?;
        Ok(())
    }

    // Launch one DMI operation and poll its status until success.  A busy
    // status is retried up to a bound; anything else is a protocol error.
    async fn dmi_exec(&mut self, addr: u32, data: u32, op: DmiOp) -> Result<u32, SwdError> {
        let addr = addr & DmiFrame::addr_mask(self.abits);
        let frame = DmiFrame::pack(addr, data, op);

        self.dap.write_ap(DMI_APSEL, ap::DMI_LO, frame.lo).await?;
        // The high-word write launches the operation
        self.dap.write_ap(DMI_APSEL, ap::DMI_HI, frame.hi).await?;

        let mut busy = 0;
        loop {
            let lo = self.dap.read_ap(DMI_APSEL, ap::DMI_LO).await?;
            let hi = self.dap.read_ap(DMI_APSEL, ap::DMI_HI).await?;
            let response = DmiFrame { lo, hi };

            match response.status() {
                DmiStatus::Success => return Ok(response.data()),
                DmiStatus::Busy => {
                    busy += 1;
                    if busy == DMI_BUSY_HINT_THRESHOLD {
                        // Advisory only - we keep the configured clock
                        info!("DMI busy x{busy}; a slower SWCLK may help");
                    }
                    if busy >= DMI_BUSY_RETRIES {
                        debug!("DMI op {op:?} at 0x{addr:02X} stuck busy");
                        return Err(SwdError::Timeout);
                    }
                    Timer::after_micros(10).await;
                }
                status => {
                    warn!("DMI op {op:?} at 0x{addr:02X} failed: {status:?}");
                    return Err(SwdError::Protocol);
                }
            }
        }
    }
}
