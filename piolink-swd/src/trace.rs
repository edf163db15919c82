// Copyright (C) 2025 piolink contributors
//
// MIT License

//! Instruction tracing
//!
//! A step-and-observe loop over a halted hart: each iteration reads the
//! PC, fetches the instruction word at that PC over the system bus (so
//! the hart's execution state is untouched), optionally snapshots the
//! GPRs, hands the record to the caller, and single-steps.
//!
//! The record always describes the hart's state as of its PC, before the
//! instruction retires.  Tracing is only well-defined while the target's
//! interrupt sources are quiesced or masked; an interrupt taken between
//! the observation and the step shows up as a PC discontinuity.

use core::result::Result;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{PIOExt, StateMachineIndex};

use crate::dm::DebugModule;
use crate::SwdError;

/// One traced instruction
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    /// PC of the instruction about to retire
    pub pc: u32,
    /// The instruction word at `pc`
    pub instruction: u32,
    /// GPR snapshot (`x0` as 0), present only when requested
    pub regs: Option<[u32; 32]>,
}

impl<P: PIOExt, SM: StateMachineIndex> DebugModule<P, SM> {
    /// Trace up to `max_instructions` instructions on a halted hart.
    ///
    /// The callback's return value is the only cancellation channel:
    /// returning `false` stops the trace after the current record, before
    /// the hart steps past it.
    ///
    /// Returns the number of records delivered, which is
    /// `max_instructions` if the callback never declined, or the
    /// (1-indexed) position of the declining callback otherwise.
    pub async fn trace<F>(
        &mut self,
        hart: u8,
        max_instructions: u32,
        mut callback: F,
        capture_regs: bool,
    ) -> Result<u32, SwdError>
    where
        F: FnMut(&TraceRecord) -> bool,
    {
        if !self.is_halted(hart).await? {
            debug!("Trace requires hart {hart} halted");
            return Err(SwdError::NotHalted);
        }

        let mut delivered = 0;
        for _ in 0..max_instructions {
            let pc = self.read_pc(hart).await?;
            let instruction = self.sba_read_mem32(pc).await?;
            let regs = if capture_regs {
                Some(self.read_all_gprs(hart).await?)
            } else {
                None
            };

            let record = TraceRecord {
                pc,
                instruction,
                regs,
            };
            delivered += 1;
            if !callback(&record) {
                trace!("Trace stopped by callback at record {delivered}");
                break;
            }

            self.step(hart).await?;
        }

        debug!("Trace delivered {delivered} records on hart {hart}");
        Ok(delivered)
    }
}
