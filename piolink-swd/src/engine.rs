// Copyright (C) 2025 piolink contributors
//
// MIT License

//! SWD line engine
//!
//! Generates the SWD waveform on a PIO state machine.  The host only
//! fills and drains the PIO FIFOs - it never busy-waits individual bit
//! times.  Each FIFO transaction starts with a control word carrying the
//! bit count and transfer direction, optionally followed by a data word;
//! reads come back through the RX FIFO.
//!
//! One SWCLK period is eight PIO cycles, so the SWCLK frequency is
//! `sys_clk / (8 * divisor)`.

use core::result::Result;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rp235x_hal::pio::{
    InstalledProgram, PIOBuilder, PIOExt, PinDir, Rx, ShiftDirection, StateMachine,
    StateMachineIndex, Tx, UninitStateMachine, PIO,
};

use crate::SwdError;
use piolink_core::arm::request::{Ack, SwdOp};
use piolink_core::calculate_parity;

// Control-word flag selecting a host-to-target transfer
const DIR_WRITE: u32 = 1 << 31;

// PIO cycles per SWCLK period with the delays used in the program
const PIO_CYCLES_PER_BIT: u32 = 8;

// One turnaround cycle, as configured in the DP (we never change TRN)
const TURNAROUND_CYCLES: u32 = 1;

// Idle clocks after each transaction and between WAIT retries
pub(crate) const IDLE_CYCLES: u32 = 8;

// JTAG-to-dormant selection sequence, 31 bits LSB-first
const JTAG_TO_DORMANT_SEQUENCE: u32 = 0x33BB_BBBA;

// Dormant-to-SWD selection alert, 128 bits sent as four LSB-first words
const SELECTION_ALERT_SEQUENCE: [u32; 4] = [0x6209_F392, 0x8685_2D95, 0xE3DD_AFE9, 0x19BC_0EA2];

// SWD activation code following the selection alert (0b01011000 MSB-first)
const SWD_ACTIVATION_CODE: u32 = 0x1A;

// Cycles with SWDIO high before the selection alert
const DORMANT_EXIT_HIGH_CYCLES: u32 = 8;

// Cycles with SWDIO low after the selection alert
const DORMANT_EXIT_LOW_CYCLES: u32 = 4;

// Line reset: 50+ cycles with SWDIO high, then 2+ idle
const LINE_RESET_HIGH_CYCLES: u32 = 51;
const LINE_RESET_LOW_CYCLES: u32 = 3;

struct EngineContext<P: PIOExt, SM: StateMachineIndex> {
    sm: StateMachine<(P, SM), rp235x_hal::pio::Running>,
    rx: Rx<(P, SM)>,
    tx: Tx<(P, SM)>,
}

/// SWD line engine on one PIO state machine
///
/// Owns the state machine and the two pins for the lifetime of the debug
/// session.  Used by [`crate::DapInterface`]; applications normally do not
/// touch this directly.
pub struct SwdEngine<P: PIOExt, SM: StateMachineIndex> {
    context: Option<EngineContext<P, SM>>,
    pin_swclk: u8,
    pin_swdio: u8,
    freq_khz: u32,
    sys_clk_khz: u32,
    wait_retries: u32,
}

impl<P: PIOExt, SM: StateMachineIndex> SwdEngine<P, SM> {
    /// Install the waveform program and start the state machine.
    ///
    /// The pins must already be handed to the PIO block (their function
    /// set to this PIO) by the caller; the engine controls their
    /// directions from the PIO program.  SWCLK idles low; SWDIO starts as
    /// an input until the first connect sequence drives it.
    pub fn new(
        pio: &mut PIO<P>,
        sm: UninitStateMachine<(P, SM)>,
        pin_swclk: u8,
        pin_swdio: u8,
        freq_khz: u32,
        sys_clk_khz: u32,
        wait_retries: u32,
    ) -> Result<Self, SwdError> {
        let program = waveform_program();
        let installed = pio.install(&program).map_err(|_| SwdError::NoMemory)?;

        let (int, frac) = divisor_fixed_point(sys_clk_khz, freq_khz);
        let (mut sm, rx, tx) = build_sm(pin_swclk, pin_swdio, installed, int, frac, sm);

        sm.set_pindirs([(pin_swclk, PinDir::Output)]);
        let sm = sm.start();

        debug!("SWD engine started: SWCLK={pin_swclk} SWDIO={pin_swdio} {freq_khz} kHz");

        Ok(Self {
            context: Some(EngineContext { sm, rx, tx }),
            pin_swclk,
            pin_swdio,
            freq_khz,
            sys_clk_khz,
            wait_retries,
        })
    }

    pub fn frequency_khz(&self) -> u32 {
        self.freq_khz
    }

    /// Reprogram the clock divider.  Permitted while connected; the line
    /// is left idle between transactions so the frequency change is safe.
    pub fn set_frequency(&mut self, freq_khz: u32) {
        let (int, frac) = divisor_fixed_point(self.sys_clk_khz, freq_khz);

        // Stop and rebuild the state machine with the new divider
        let context = self.context.take().unwrap();
        let (sm, installed) = context.sm.uninit(context.rx, context.tx);
        let (mut sm, rx, tx) = build_sm(self.pin_swclk, self.pin_swdio, installed, int, frac, sm);
        sm.set_pindirs([(self.pin_swclk, PinDir::Output)]);
        let sm = sm.start();
        self.context = Some(EngineContext { sm, rx, tx });

        self.freq_khz = freq_khz;
        debug!("SWD clock set to {freq_khz} kHz");
    }

    pub fn set_wait_retries(&mut self, retries: u32) {
        self.wait_retries = retries;
    }

    // Clock out `count` bits of `value`, LSB first.  `count` of 0 only
    // updates the SWDIO level and direction without clocking.
    pub(crate) fn write_bits(&mut self, count: u32, value: u32) {
        let context = self.context.as_mut().unwrap();
        while !context.tx.write(count | DIR_WRITE) {}
        while !context.tx.write(value) {}
    }

    // Clock in `count` bits, LSB first.  `count` of 0 turns SWDIO around
    // to an input and samples once without clocking.
    pub(crate) fn read_bits(&mut self, count: u32) -> u32 {
        let context = self.context.as_mut().unwrap();
        while !context.tx.write(count) {}
        loop {
            if let Some(value) = context.rx.read() {
                // First bit arrives in the LSB once right-aligned
                return value.wrapping_shr(count.wrapping_neg());
            }
        }
    }

    /// Emit `count` idle clocks (SWDIO driven low)
    pub(crate) fn idle_clocks(&mut self, count: u32) {
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(32);
            self.write_bits(chunk, 0);
            remaining -= chunk;
        }
    }

    /// Set SWDIO to an output at the given level, without clocking
    pub(crate) fn swdio_drive(&mut self, high: bool) {
        self.write_bits(0, high as u32);
    }

    /// Release SWDIO to an input, without clocking
    pub(crate) fn swdio_release(&mut self) {
        let _ = self.read_bits(0);
    }

    /// Line reset: 50+ clocks with SWDIO high, then 2+ idle clocks
    pub(crate) fn line_reset(&mut self) {
        self.write_bits(32, u32::MAX);
        self.write_bits(LINE_RESET_HIGH_CYCLES - 32, u32::MAX);
        self.idle_clocks(LINE_RESET_LOW_CYCLES);
    }

    /// Put a JTAG-capable DP into dormant state
    pub(crate) fn jtag_to_dormant(&mut self) {
        self.write_bits(31, JTAG_TO_DORMANT_SEQUENCE);
    }

    /// Wake a dormant DP into SWD operation: high cycles, the 128-bit
    /// selection alert, low cycles, then the SWD activation code
    pub(crate) fn dormant_to_swd(&mut self) {
        self.write_bits(DORMANT_EXIT_HIGH_CYCLES, u32::MAX);
        for &word in SELECTION_ALERT_SEQUENCE.iter() {
            self.write_bits(32, word);
        }
        self.write_bits(DORMANT_EXIT_LOW_CYCLES, 0);
        self.write_bits(8, SWD_ACTIVATION_CODE);
    }

    /// Perform one SWD transaction: request, ACK, data and parity.
    ///
    /// `data` is ignored for reads.  WAIT ACKs are retried up to the
    /// configured budget with eight idle clocks between attempts;
    /// exhaustion returns [`SwdError::Wait`].  Returns the data word
    /// read, or 0 for writes.
    pub(crate) fn transaction(&mut self, op: SwdOp, data: u32) -> Result<u32, SwdError> {
        let mut attempt = 0;
        loop {
            match self.transfer_once(op, data) {
                Err(SwdError::Wait) => {
                    attempt += 1;
                    if attempt > self.wait_retries {
                        debug!("Error: {op} WAIT retries exhausted");
                        break Err(SwdError::Wait);
                    }
                    trace!("Retry: {op} after WAIT {attempt}");
                    self.idle_clocks(IDLE_CYCLES);
                }
                result => break result,
            }
        }
    }

    fn transfer_once(&mut self, op: SwdOp, data: u32) -> Result<u32, SwdError> {
        let request = op.request();
        trace!("Exec:  {op} SWD: {request:#04X}");

        self.write_bits(8, request as u32);

        if op.is_read() {
            // Turnaround plus the three ACK bits
            let bits = self.read_bits(3 + TURNAROUND_CYCLES);
            let ack = Ack::from_bits((bits >> TURNAROUND_CYCLES) as u8);

            match SwdError::from_ack(ack) {
                Ok(()) => {
                    let value = self.read_bits(32);
                    // Data parity plus the turnaround back to us
                    let parity = self.read_bits(1 + TURNAROUND_CYCLES) & 1;
                    self.idle_clocks(IDLE_CYCLES);

                    if calculate_parity(value) as u32 != parity {
                        debug!("SWD read parity error: data={value:#010X} parity={parity}");
                        return Err(SwdError::Parity);
                    }
                    trace!("OK:    {op} {value:#010X}");
                    Ok(value)
                }
                Err(e) => {
                    self.recover_line(op, ack);
                    Err(e)
                }
            }
        } else {
            // Turnaround, ACK, and the turnaround back to us
            let bits = self.read_bits(3 + 2 * TURNAROUND_CYCLES);
            let ack = Ack::from_bits((bits >> TURNAROUND_CYCLES) as u8);

            match SwdError::from_ack(ack) {
                Ok(()) => {
                    self.write_bits(32, data);
                    self.write_bits(1, calculate_parity(data) as u32);
                    self.idle_clocks(IDLE_CYCLES);
                    trace!("OK:    {op} {data:#010X}");
                    Ok(0)
                }
                Err(e) => {
                    self.recover_line(op, ack);
                    Err(e)
                }
            }
        }
    }

    // Bring the line back to a driven idle state after a non-OK ACK.  On
    // an unrecognised ACK the target may be driving a data phase, so
    // clock through one before taking the line back.
    fn recover_line(&mut self, op: SwdOp, ack: Ack) {
        trace!("Info:  {op} ACK {ack}");
        if matches!(ack, Ack::Invalid(_)) {
            let _ = self.read_bits(32);
            let _ = self.read_bits(1 + TURNAROUND_CYCLES);
        } else if op.is_read() {
            // The write path already consumed the trailing turnaround
            let _ = self.read_bits(TURNAROUND_CYCLES);
        }
        self.idle_clocks(IDLE_CYCLES);
    }

    /// Leave the bus: SWDIO released to an input, SWCLK idle low
    pub(crate) fn release_bus(&mut self) {
        self.swdio_release();
    }
}

// Fixed-point (16.8) clock divider for the requested SWCLK frequency
fn divisor_fixed_point(sys_clk_khz: u32, freq_khz: u32) -> (u16, u8) {
    let div_x256 = (sys_clk_khz as u64 * 256) / (freq_khz as u64 * PIO_CYCLES_PER_BIT as u64);
    let div_x256 = div_x256.clamp(256, 0xFFFF_FF) as u32;
    ((div_x256 >> 8) as u16, (div_x256 & 0xFF) as u8)
}

fn build_sm<P: PIOExt, SM: StateMachineIndex>(
    pin_swclk: u8,
    pin_swdio: u8,
    installed: InstalledProgram<P>,
    div_int: u16,
    div_frac: u8,
    sm: UninitStateMachine<(P, SM)>,
) -> (
    StateMachine<(P, SM), rp235x_hal::pio::Stopped>,
    Rx<(P, SM)>,
    Tx<(P, SM)>,
) {
    PIOBuilder::from_installed_program(installed)
        .set_pins(pin_swclk, 1)
        .side_set_pin_base(pin_swclk)
        .out_pins(pin_swdio, 1)
        .in_pin_base(pin_swdio)
        .out_shift_direction(ShiftDirection::Right)
        .in_shift_direction(ShiftDirection::Right)
        .clock_divisor_fixed_point(div_int, div_frac)
        .build(sm)
}

// The waveform program.  Each transfer is started by a control word
// {dir[31], count[30:0]}; writes are followed by one data word, reads
// push one result word.  A count of zero performs only the direction
// change (and, for reads, one unclocked sample).  SWCLK is on the
// side-set and set pins; SWDIO is the out/in pin.
#[rustfmt::skip]
fn waveform_program() -> pio::Program<{ pio::RP2040_MAX_PROGRAM_SIZE }> {
    let mut a = pio::Assembler::<{ pio::RP2040_MAX_PROGRAM_SIZE }>::new_with_side_set(
        pio::SideSet::new(true, 1, false),
    );

    let mut write_loop = a.label();
    let mut write_enter = a.label();
    let mut read_start = a.label();
    let mut read_loop = a.label();
    let mut read_enter = a.label();
    let mut wrap_target = a.label();
    let mut wrap_source = a.label();

    const HI: u8 = 1;
    const LO: u8 = 0;
    // Delay per half period; with the instruction itself this gives four
    // PIO cycles per phase
    const Q: u8 = 3;

    a.bind(&mut wrap_target);
    // Fetch the control word: count to X, direction bit to Y
    a.pull(false, true);
    a.out(pio::OutDestination::X, 31);
    a.mov(pio::MovDestination::Y, pio::MovOperation::None, pio::MovSource::OSR);
    a.jmp(pio::JmpCondition::YIsZero, &mut read_start);

    // Write: fetch data, put the first bit on SWDIO before turning the
    // pin around, stashing the rest in ISR while Y (=1) sets PINDIRS
    a.pull(false, true);
    a.out(pio::OutDestination::PINS, 1);
    a.mov(pio::MovDestination::ISR, pio::MovOperation::None, pio::MovSource::OSR);
    a.mov(pio::MovDestination::OSR, pio::MovOperation::None, pio::MovSource::Y);
    a.out(pio::OutDestination::PINDIRS, 1);
    a.mov(pio::MovDestination::OSR, pio::MovOperation::None, pio::MovSource::ISR);
    a.jmp(pio::JmpCondition::XDecNonZero, &mut write_enter);
    // Count was zero: level and direction updated, no clocking
    a.jmp(pio::JmpCondition::Always, &mut wrap_target);

    a.bind(&mut write_loop);
    // Rising edge, then the next data bit while SWCLK is high
    a.set(pio::SetDestination::PINS, HI);
    a.out_with_delay(pio::OutDestination::PINS, 1, Q - 1);
    a.bind(&mut write_enter);
    // Falling edge; loop until all bits are clocked
    a.jmp_with_delay_and_side_set(pio::JmpCondition::XDecNonZero, &mut write_loop, Q, LO);
    a.set(pio::SetDestination::PINS, HI);
    a.jmp(pio::JmpCondition::Always, &mut wrap_target);

    // Read: release SWDIO (direction bit from the control word is zero)
    a.bind(&mut read_start);
    a.out_with_delay(pio::OutDestination::PINDIRS, 1, Q - 1);
    a.jmp(pio::JmpCondition::XDecNonZero, &mut read_enter);
    // Count was zero: sample once without clocking
    a.nop_with_delay(Q);
    a.r#in(pio::InSource::PINS, 1);
    a.r#in(pio::InSource::NULL, 31);
    a.push(false, true);
    a.jmp(pio::JmpCondition::Always, &mut wrap_target);

    a.bind(&mut read_loop);
    // Sample on the rising edge
    a.r#in_with_delay_and_side_set(pio::InSource::PINS, 1, Q, HI);
    a.bind(&mut read_enter);
    a.jmp_with_delay_and_side_set(pio::JmpCondition::XDecNonZero, &mut read_loop, Q, LO);
    a.r#in_with_side_set(pio::InSource::PINS, 1, HI);
    a.push(false, true);
    a.bind(&mut wrap_source);

    a.assemble_with_wrap(wrap_source, wrap_target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_calculation() {
        // 150 MHz system clock, 1 MHz SWCLK: 150000/(1000*8) = 18.75
        assert_eq!(divisor_fixed_point(150_000, 1000), (18, 192));
        // 2 MHz SWCLK: 9.375
        assert_eq!(divisor_fixed_point(150_000, 2000), (9, 96));
        // 100 kHz SWCLK: 187.5
        assert_eq!(divisor_fixed_point(150_000, 100), (187, 128));
    }

    #[test]
    fn divisor_clamps_to_unity() {
        // Requests beyond what the program can clock stop at divider 1.0
        assert_eq!(divisor_fixed_point(150_000, 100_000), (1, 0));
    }

    #[test]
    fn waveform_program_assembles() {
        let program = waveform_program();
        assert!(program.code.len() <= pio::RP2040_MAX_PROGRAM_SIZE);
    }
}
