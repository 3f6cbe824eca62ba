//! Simulated cable: an MPSSE command interpreter wired to a model of an ECP5/NX TAP with a SPI
//! NOR flash behind its background SPI port.  Every TCK is logged, which makes it usable as a
//! test double for the layers above `Cable`.
//!
//! `SimCable::loopback` instead wires TDI straight back to TDO.
use std::collections::VecDeque;

use embedded_hal::delay::DelayNs;
use log::trace;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::lattice::Instruction;
use crate::spi::BACKGROUND_SPI_KEY;
use crate::statemachine::TapState;

pub mod nor;

use nor::SpiNor;

const PIN_TMS: u8 = 1 << 3;

// ECP5 status register bits touched by the model
const STATUS_DONE: u64 = 1 << 8;
const STATUS_ISC_ENABLE: u64 = 1 << 9;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub idcode: u32,
    /// Status register value before any configuration command.
    pub status: u64,
    pub flash_size: usize,
    pub jedec_id: [u8; 3],
    /// Status polls that report busy after each program or erase.
    pub busy_polls: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            idcode: 0x41111043,
            status: 0,
            flash_size: 16 << 20,
            jedec_id: [0xEF, 0x40, 0x18],
            busy_polls: 2,
        }
    }
}

/// Levels of TMS and TDI on one rising edge of TCK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Clock {
    pub tms: bool,
    pub tdi: bool,
}

/// The FPGA side of the simulation.
struct Target {
    config: SimConfig,
    tap: TapState,
    ir: u8,
    ir_shift: u8,
    dr_capture: u64,
    dr_in: Vec<bool>,
    status: u64,
    spi_enabled: bool,
    flash: SpiNor,
    instructions: Vec<u8>,
    bitstream: Vec<u8>,
    bitstream_acc: u8,
    bitstream_bits: u8,
    refreshes: u32,
}

impl Target {
    fn new(config: SimConfig) -> Self {
        let flash = SpiNor::new(config.flash_size, config.jedec_id, config.busy_polls);
        Self {
            tap: TapState::Reset,
            ir: Instruction::ReadId as u8,
            ir_shift: 0,
            dr_capture: 0,
            dr_in: Vec::new(),
            status: config.status,
            spi_enabled: false,
            flash,
            instructions: Vec::new(),
            bitstream: Vec::new(),
            bitstream_acc: 0,
            bitstream_bits: 0,
            refreshes: 0,
            config,
        }
    }

    fn spi_passthrough(&self) -> bool {
        self.spi_enabled && self.ir == Instruction::LscBackgroundSpi as u8
    }

    /// One TCK.  Returns TDO.
    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let tdo = match self.tap {
            TapState::ShiftDR => self.shift_dr(tdi),
            TapState::ShiftIR => {
                let tdo = self.ir_shift & 1 != 0;
                self.ir_shift = (self.ir_shift >> 1) | ((tdi as u8) << 7);
                tdo
            }
            _ => true,
        };

        let old = self.tap;
        self.tap = old.next(tms);
        if old == TapState::ShiftDR && self.tap != TapState::ShiftDR && self.spi_passthrough() {
            self.flash.deselect();
        }
        if old != self.tap {
            self.enter(self.tap);
        }
        tdo
    }

    fn shift_dr(&mut self, tdi: bool) -> bool {
        self.dr_in.push(tdi);
        if self.spi_passthrough() {
            return self.flash.clock(tdi);
        }
        if self.ir == Instruction::LscBitstreamBurst as u8 {
            self.bitstream_acc = (self.bitstream_acc << 1) | tdi as u8;
            self.bitstream_bits += 1;
            if self.bitstream_bits == 8 {
                self.bitstream.push(self.bitstream_acc);
                self.bitstream_acc = 0;
                self.bitstream_bits = 0;
            }
        }
        let tdo = self.dr_capture & 1 != 0;
        self.dr_capture >>= 1;
        tdo
    }

    fn enter(&mut self, state: TapState) {
        match state {
            TapState::Reset => {
                self.ir = Instruction::ReadId as u8;
            }
            TapState::CaptureIR => {
                self.ir_shift = 0x01;
            }
            TapState::UpdateIR => {
                self.ir = self.ir_shift;
                self.instructions.push(self.ir);
                self.execute();
            }
            TapState::CaptureDR => {
                self.dr_in.clear();
                self.dr_capture = if self.ir == Instruction::ReadId as u8 {
                    self.config.idcode as u64
                } else if self.ir == Instruction::LscReadStatus as u8 {
                    self.status
                } else {
                    0
                };
            }
            TapState::ShiftDR => {
                if self.spi_passthrough() {
                    self.flash.select();
                }
            }
            TapState::UpdateDR => {
                if self.ir == Instruction::LscBackgroundSpi as u8 && self.dr_in.len() == 16 {
                    let mut key = [0u8; 2];
                    for (i, &b) in self.dr_in.iter().enumerate() {
                        key[i / 8] |= (b as u8) << (i % 8);
                    }
                    self.spi_enabled = key == BACKGROUND_SPI_KEY;
                }
            }
            _ => {}
        }
    }

    fn execute(&mut self) {
        match self.ir {
            ir if ir == Instruction::IscEnable as u8 => {
                self.status |= STATUS_ISC_ENABLE;
            }
            ir if ir == Instruction::IscErase as u8 => {
                self.status &= !STATUS_DONE;
            }
            ir if ir == Instruction::IscDisable as u8 => {
                self.status &= !STATUS_ISC_ENABLE;
                if !self.bitstream.is_empty() {
                    self.status |= STATUS_DONE;
                }
            }
            ir if ir == Instruction::LscBitstreamBurst as u8 => {
                self.bitstream.clear();
                self.bitstream_acc = 0;
                self.bitstream_bits = 0;
            }
            ir if ir == Instruction::LscRefresh as u8 => {
                self.refreshes += 1;
                self.spi_enabled = false;
            }
            _ => {}
        }
    }
}

pub struct SimCable {
    target: Target,
    loopback: bool,
    pending: Vec<u8>,
    responses: VecDeque<u8>,
    tms_level: bool,
    tdi_level: bool,
    log: Vec<Clock>,
    writes: usize,
}

impl SimCable {
    pub fn new(config: SimConfig) -> Self {
        Self {
            target: Target::new(config),
            loopback: false,
            pending: Vec::new(),
            responses: VecDeque::new(),
            tms_level: true,
            tdi_level: true,
            log: Vec::new(),
            writes: 0,
        }
    }

    /// TDO follows TDI on every clock.  The TAP is still tracked.
    pub fn loopback() -> Self {
        let mut sim = Self::new(SimConfig::default());
        sim.loopback = true;
        sim
    }

    pub fn clocks(&self) -> &[Clock] {
        &self.log
    }

    pub fn tms_bits(&self) -> Vec<bool> {
        self.log.iter().map(|c| c.tms).collect()
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Number of `write_bytes` calls so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn tap_state(&self) -> TapState {
        self.target.tap
    }

    pub fn spi_enabled(&self) -> bool {
        self.target.spi_enabled
    }

    /// Every instruction latched in Update-IR, oldest first.
    pub fn instructions(&self) -> Vec<u8> {
        self.target.instructions.clone()
    }

    /// Bytes received through `LSC_BITSTREAM_BURST`, in file order.
    pub fn bitstream(&self) -> &[u8] {
        &self.target.bitstream
    }

    pub fn refreshes(&self) -> u32 {
        self.target.refreshes
    }

    pub fn status(&self) -> u64 {
        self.target.status
    }

    pub fn flash(&self) -> &SpiNor {
        &self.target.flash
    }

    pub fn flash_mut(&mut self) -> &mut SpiNor {
        &mut self.target.flash
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        self.log.push(Clock { tms, tdi });
        let tdo = self.target.clock(tms, tdi);
        if self.loopback { tdi } else { tdo }
    }

    /// Clock LSB-first bits of `byte` with TMS held.  Returns TDO, bit i in bit i.
    fn clock_byte(&mut self, byte: u8, bits: usize) -> u8 {
        let mut rx = 0;
        for i in 0..bits {
            let tdi = byte & (1 << i) != 0;
            if self.clock(self.tms_level, tdi) {
                rx |= 1 << i;
            }
            self.tdi_level = tdi;
        }
        rx
    }

    /// Length of the command at the start of `cmd`, or `None` if it is not complete yet.
    fn command_len(cmd: &[u8]) -> Option<usize> {
        let op = *cmd.first()?;
        let len = match op {
            0x19 | 0x39 => {
                if cmd.len() < 3 {
                    return None;
                }
                3 + (cmd[1] as usize | (cmd[2] as usize) << 8) + 1
            }
            0x1B | 0x3B | 0x4B | 0x6B | 0x80 | 0x82 | 0x86 | 0x8F => 3,
            0x8E => 2,
            _ => 1,
        };
        if cmd.len() >= len { Some(len) } else { None }
    }

    fn execute(&mut self, cmd: &[u8]) {
        match cmd[0] {
            op @ (0x19 | 0x39) => {
                for &b in &cmd[3..] {
                    let rx = self.clock_byte(b, 8);
                    if op == 0x39 {
                        self.responses.push_back(rx);
                    }
                }
            }
            op @ (0x1B | 0x3B) => {
                let bits = cmd[1] as usize + 1;
                let rx = self.clock_byte(cmd[2], bits);
                if op == 0x3B {
                    // bit reads shift in from the top
                    self.responses.push_back(((rx as u16) << (8 - bits)) as u8);
                }
            }
            op @ (0x4B | 0x6B) => {
                let bits = cmd[1] as usize + 1;
                let tdi = cmd[2] & 0x80 != 0;
                self.tdi_level = tdi;
                let mut rx = 0u8;
                for i in 0..bits {
                    let tms = cmd[2] & (1 << i) != 0;
                    self.tms_level = tms;
                    let tdo = self.clock(tms, tdi);
                    rx = (rx >> 1) | ((tdo as u8) << 7);
                }
                if op == 0x6B {
                    self.responses.push_back(rx);
                }
            }
            0x8E => {
                for _ in 0..=cmd[1] {
                    self.clock(self.tms_level, self.tdi_level);
                }
            }
            0x8F => {
                let n = (cmd[1] as usize | (cmd[2] as usize) << 8) + 1;
                for _ in 0..n * 8 {
                    self.clock(self.tms_level, self.tdi_level);
                }
            }
            0x80 => {
                self.tms_level = cmd[1] & PIN_TMS != 0;
            }
            0x81 | 0x83 => self.responses.push_back(0),
            // clock setup, loopback off, send immediate, upper GPIO
            0x82 | 0x85 | 0x86 | 0x87 | 0x8A | 0x8B | 0x8D | 0x97 => {}
            op => {
                self.responses.push_back(0xFA);
                self.responses.push_back(op);
            }
        }
    }
}

impl Cable for SimCable {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writes += 1;
        self.pending.extend_from_slice(data);
        let mut start = 0;
        while let Some(len) = Self::command_len(&self.pending[start..]) {
            let cmd = self.pending[start..start + len].to_vec();
            self.execute(&cmd);
            start += len;
        }
        self.pending.drain(..start);
        trace!("sim: {} bytes in, {} responses queued", data.len(), self.responses.len());
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.responses.len());
        for b in buf[..n].iter_mut() {
            *b = self.responses.pop_front().ok_or(Error::ReadTimeout {
                received: 0,
                expected: n,
            })?;
        }
        Ok(n)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        // Everything the simulation will ever answer is already queued.
        if self.responses.len() < buf.len() {
            return Err(Error::ReadTimeout {
                received: self.responses.len(),
                expected: buf.len(),
            });
        }
        self.read_bytes(buf).map(|_| ())
    }
}

/// Delay that returns immediately, for running flash operations against the simulation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::{JtagSM, Register};

    #[test]
    fn idcode_reads_back() {
        let mut jtag = JtagSM::new(Box::new(SimCable::new(SimConfig::default()))).unwrap();
        jtag.write_reg(Register::Instruction, &[Instruction::ReadId as u8], 8).unwrap();
        let id = jtag.read_reg(Register::Data, 32).unwrap();
        assert_eq!(id, 0x41111043u32.to_le_bytes());
        assert_eq!(jtag.cable.instructions(), vec![0xE0]);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut sim = SimCable::loopback();
        sim.write_bytes(&[0xAB]).unwrap();
        let mut buf = [0; 2];
        sim.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0xFA, 0xAB]);
    }

    #[test]
    fn split_commands_are_reassembled() {
        let mut sim = SimCable::loopback();
        // 0x4B: 3 TMS ones
        sim.write_bytes(&[0x4B, 0x02]).unwrap();
        assert!(sim.clocks().is_empty());
        sim.write_bytes(&[0x07]).unwrap();
        assert_eq!(sim.tms_bits(), vec![true; 3]);
    }

    #[test]
    fn missing_response_times_out() {
        let mut sim = SimCable::loopback();
        let mut buf = [0; 1];
        assert!(matches!(sim.read_exact(&mut buf), Err(Error::ReadTimeout { .. })));
    }
}
