//! A small SPI NOR model behind the simulated FPGA's background SPI port.  Behaves like a
//! W25Q-series part: commands run when chip select is released, program and erase need the
//! write-enable latch, and the part reports busy for a few status polls after each operation.
use std::collections::VecDeque;

use crate::flash::{Command, STATUS_BUSY, STATUS_WEL};

/// Operations the flash actually carried out, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlashOp {
    Erase { address: u32, size: u32 },
    ChipErase,
    Program { address: u32, len: usize },
    WriteStatus(u8),
}

pub struct SpiNor {
    memory: Vec<u8>,
    jedec_id: [u8; 3],
    status1: u8,
    status2: u8,
    busy_polls: u32,
    busy_remaining: u32,
    busy_pattern: VecDeque<bool>,
    latched_status: u8,
    selected: bool,
    rx: Vec<u8>,
    in_byte: u8,
    in_bits: u8,
    out_byte: u8,
    ops: Vec<FlashOp>,
    status_reads: u32,
}

impl SpiNor {
    pub fn new(size: usize, jedec_id: [u8; 3], busy_polls: u32) -> Self {
        Self {
            memory: vec![0xFF; size],
            jedec_id,
            status1: 0,
            status2: 0,
            busy_polls,
            busy_remaining: 0,
            busy_pattern: VecDeque::new(),
            latched_status: 0,
            selected: false,
            rx: Vec::new(),
            in_byte: 0,
            in_bits: 0,
            out_byte: 0xFF,
            ops: Vec::new(),
            status_reads: 0,
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn status1(&self) -> u8 {
        self.status1
    }

    pub fn set_status1(&mut self, value: u8) {
        self.status1 = value;
    }

    /// Number of status register 1 reads so far.
    pub fn status_reads(&self) -> u32 {
        self.status_reads
    }

    /// Busy bit values returned by the next status reads, ahead of the usual countdown.
    pub fn queue_busy_pattern(&mut self, pattern: &[bool]) {
        self.busy_pattern.extend(pattern.iter().copied());
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn select(&mut self) {
        self.selected = true;
        self.rx.clear();
        self.in_byte = 0;
        self.in_bits = 0;
        self.out_byte = 0xFF;
    }

    /// One SCK: sample MOSI and return MISO.
    pub fn clock(&mut self, mosi: bool) -> bool {
        if !self.selected {
            return true;
        }
        let miso = self.out_byte & 0x80 != 0;
        self.out_byte <<= 1;
        self.in_byte = (self.in_byte << 1) | mosi as u8;
        self.in_bits += 1;
        if self.in_bits == 8 {
            self.rx.push(self.in_byte);
            self.in_byte = 0;
            self.in_bits = 0;
            self.out_byte = self.next_out();
        }
        miso
    }

    fn busy(&self) -> bool {
        self.busy_remaining > 0
    }

    fn address(&self) -> Option<u32> {
        if self.rx.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([0, self.rx[1], self.rx[2], self.rx[3]]))
    }

    fn next_out(&mut self) -> u8 {
        let n = self.rx.len();
        let cmd = self.rx[0];
        if cmd == Command::ReadStatus1 as u8 {
            if n == 1 {
                self.status_reads += 1;
                let busy = match self.busy_pattern.pop_front() {
                    Some(b) => b,
                    None if self.busy_remaining > 0 => {
                        self.busy_remaining -= 1;
                        true
                    }
                    None => false,
                };
                self.latched_status = self.status1 | if busy { STATUS_BUSY } else { 0 };
            }
            return self.latched_status;
        }
        if self.busy() {
            return 0xFF;
        }
        match cmd {
            c if c == Command::ReadStatus2 as u8 => self.status2,
            c if c == Command::ReadJedecId as u8 => match n {
                1..=3 => self.jedec_id[n - 1],
                _ => 0xFF,
            },
            c if c == Command::ReadData as u8 => match self.address() {
                Some(addr) => {
                    let a = (addr as usize + n - 4) % self.memory.len();
                    self.memory[a]
                }
                None => 0xFF,
            },
            _ => 0xFF,
        }
    }

    /// Chip select released: run whatever command was clocked in.
    pub fn deselect(&mut self) {
        if !self.selected {
            return;
        }
        self.selected = false;
        let rx = std::mem::take(&mut self.rx);
        if rx.is_empty() || self.busy() {
            return;
        }
        let wel = self.status1 & STATUS_WEL != 0;
        let cmd = rx[0];
        let addr = if rx.len() >= 4 {
            Some(u32::from_be_bytes([0, rx[1], rx[2], rx[3]]))
        } else {
            None
        };

        if cmd == Command::WriteEnable as u8 {
            self.status1 |= STATUS_WEL;
        } else if cmd == Command::WriteDisable as u8 {
            self.status1 &= !STATUS_WEL;
        } else if cmd == Command::PageProgram as u8 {
            if let (true, Some(address)) = (wel, addr) {
                let data = &rx[4..];
                let base = (address & !0xFF) as usize;
                for (i, b) in data.iter().enumerate() {
                    let a = base + ((address as usize + i) & 0xFF);
                    if let Some(m) = self.memory.get_mut(a) {
                        *m &= *b;
                    }
                }
                self.ops.push(FlashOp::Program { address, len: data.len() });
                self.finish_write();
            }
        } else if let Some(size) = erase_size(cmd) {
            if let (true, Some(address)) = (wel, addr) {
                let base = (address & !(size - 1)) as usize;
                let end = (base + size as usize).min(self.memory.len());
                if base < end {
                    self.memory[base..end].fill(0xFF);
                }
                self.ops.push(FlashOp::Erase { address, size });
                self.finish_write();
            }
        } else if cmd == Command::ChipErase as u8 {
            if wel {
                self.memory.fill(0xFF);
                self.ops.push(FlashOp::ChipErase);
                self.finish_write();
            }
        } else if cmd == Command::WriteStatus1 as u8 && wel && rx.len() >= 2 {
            self.status1 = rx[1] & !(STATUS_BUSY | STATUS_WEL);
            self.ops.push(FlashOp::WriteStatus(rx[1]));
            self.finish_write();
        }
    }

    fn finish_write(&mut self) {
        self.status1 &= !STATUS_WEL;
        self.busy_remaining = self.busy_polls;
    }
}

fn erase_size(cmd: u8) -> Option<u32> {
    match cmd {
        c if c == Command::SectorErase4K as u8 => Some(0x1000),
        c if c == Command::BlockErase32K as u8 => Some(0x8000),
        c if c == Command::BlockErase64K as u8 => Some(0x10000),
        _ => None,
    }
}
