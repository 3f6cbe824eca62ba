//! The operations a front end needs: identify the FPGA, read its status, and program its SPI
//! flash or SRAM.
use std::io::{ErrorKind, Read};
use std::ops::Range;
use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};

use crate::cable::{self, Cable, CableConfig};
use crate::error::{Error, Result};
use crate::flash::{FlashConfig, JedecId, SpiFlash};
use crate::lattice::{DecodedStatus, DeviceIdentity, Family, Instruction};
use crate::statemachine::{JtagSM, Register, TapState};

/// Idle clocks after each configuration command.
const COMMAND_IDLE_CLOCKS: usize = 32;
/// Bitstream bytes per SRAM burst shift.
pub const SRAM_CHUNK: usize = 16 * 1024;

/// `DelayNs` backed by `std::thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns as u64));
    }
}

pub struct Programmer<T, D = StdDelay> {
    jtag: JtagSM<T>,
    delay: D,
    config: FlashConfig,
    device: Option<DeviceIdentity>,
    flash_mode: bool,
}

impl Programmer<Box<dyn Cable>> {
    /// Open the named cable and reset the TAP.
    pub fn initialize(cable_name: &str, cable: &CableConfig, config: FlashConfig)
        -> Result<Self>
    {
        info!("init..");
        let cable = cable::new_from_string(cable_name, cable)?;
        Self::new(cable, StdDelay, config)
    }
}

impl<T, U, D> Programmer<T, D>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized,
          D: DelayNs
{
    pub fn new(cable: T, delay: D, config: FlashConfig) -> Result<Self> {
        Ok(Self {
            jtag: JtagSM::new(cable)?,
            delay,
            config,
            device: None,
            flash_mode: false,
        })
    }

    pub fn jtag(&mut self) -> &mut JtagSM<T> {
        &mut self.jtag
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// The result of the last `identify`.
    pub fn device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref()
    }

    fn family(&self) -> Family {
        self.device.as_ref().map_or(Family::Unknown, |d| d.family)
    }

    /// Read IDCODE and look it up.  An unknown part is reported but not fatal.
    pub fn identify(&mut self) -> Result<DeviceIdentity> {
        self.jtag.write_reg(Register::Instruction, &[Instruction::ReadId as u8],
            Instruction::ReadId.ir_bits())?;
        let data = self.jtag.read_reg(Register::Data, 32)?;
        let idcode = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let device = DeviceIdentity::lookup(idcode);
        if device.is_known() {
            info!("{}", device);
        } else {
            warn!("{}", device);
        }
        self.device = Some(device.clone());
        Ok(device)
    }

    /// Read the configuration status register.  NX parts have a 64-bit register, everything
    /// else is read as ECP5.
    pub fn read_status(&mut self) -> Result<DecodedStatus> {
        let family = self.family();
        self.jtag.write_reg(Register::Instruction, &[Instruction::LscReadStatus as u8],
            Instruction::LscReadStatus.ir_bits())?;
        let bits = family.status_bits();
        let data = self.jtag.read_reg(Register::Data, bits)?;
        let status = DecodedStatus::from_bytes(family, &data);
        info!("{}", status);
        debug!("{:#}", status);
        Ok(status)
    }

    fn load_instruction(&mut self, instr: Instruction) -> Result<()> {
        self.jtag.write_reg(Register::Instruction, &[instr as u8], instr.ir_bits())
    }

    fn settle(&mut self) -> Result<()> {
        self.jtag.go_to_state(TapState::Idle)?;
        self.jtag.idle(COMMAND_IDLE_CLOCKS)?;
        self.jtag.flush()
    }

    /// Issue an instruction that takes no DR payload, then idle for 32 clocks.
    pub fn command(&mut self, instr: Instruction) -> Result<()> {
        match instr.payload_bits(self.family()) {
            Some(0) | None => {}
            Some(n) => return Err(Error::InvalidArgument(format!(
                "{:?} takes a {} bit payload", instr, n))),
        }
        self.load_instruction(instr)?;
        self.settle()
    }

    /// Issue an instruction with an 8-bit DR parameter, then idle for 32 clocks.
    pub fn command8(&mut self, instr: Instruction, param: u8) -> Result<()> {
        if instr.payload_bits(self.family()) != Some(8) {
            return Err(Error::InvalidArgument(format!("{:?} does not take an 8 bit payload", instr)));
        }
        self.load_instruction(instr)?;
        self.jtag.write_reg(Register::Data, &[param], 8)?;
        self.settle()
    }

    /// Release the SPI port from the FPGA, unlock background SPI and reset the flash.
    pub fn enter_flash_mode(&mut self) -> Result<JedecId> {
        info!("reset..");
        self.command8(Instruction::IscEnable, 0)?;
        self.delay.delay_ms(10);
        self.command8(Instruction::IscErase, 0)?;
        self.delay.delay_ms(10);
        self.command(Instruction::IscDisable)?;

        self.jtag.enter_spi_background_mode()?;
        let mut flash = self.flash();
        flash.reset()?;
        let id = flash.read_jedec_id()?;
        info!("flash ID: {}", id);
        flash.log_status()?;
        self.flash_mode = true;
        Ok(id)
    }

    fn ensure_flash_mode(&mut self) -> Result<()> {
        if !self.flash_mode {
            self.enter_flash_mode()?;
        }
        Ok(())
    }

    /// Direct access to the flash engine.  Background SPI must be unlocked first.
    pub fn flash(&mut self) -> SpiFlash<'_, T, D> {
        SpiFlash::new(&mut self.jtag, &mut self.delay, &self.config)
    }

    /// Erase every configured-size block touching `range`.  Returns what was actually erased.
    pub fn erase(&mut self, range: Range<u32>) -> Result<Range<u32>> {
        self.ensure_flash_mode()?;
        let len = range.end.saturating_sub(range.start);
        self.flash().erase(range.start, len)
    }

    pub fn bulk_erase(&mut self) -> Result<()> {
        self.ensure_flash_mode()?;
        self.flash().chip_erase()
    }

    pub fn disable_protection(&mut self) -> Result<()> {
        self.ensure_flash_mode()?;
        self.flash().disable_protection()
    }

    /// Program `data` at `offset`.  The range must already be erased.
    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.program_with_progress(offset, data, |_| {})
    }

    pub fn program_with_progress<F>(&mut self, offset: u32, data: &[u8], progress: F)
        -> Result<()>
        where F: FnMut(usize)
    {
        self.ensure_flash_mode()?;
        info!("programming..");
        self.flash().program_with_progress(offset, data, progress)
    }

    pub fn verify(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.verify_with_progress(offset, data, |_| {})
    }

    pub fn verify_with_progress<F>(&mut self, offset: u32, data: &[u8], progress: F)
        -> Result<()>
        where F: FnMut(usize)
    {
        self.ensure_flash_mode()?;
        info!("reading..");
        self.flash().verify_with_progress(offset, data, progress)?;
        info!("VERIFY OK");
        Ok(())
    }

    pub fn read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        self.read_with_progress(offset, len, |_| {})
    }

    pub fn read_with_progress<F>(&mut self, offset: u32, len: usize, progress: F)
        -> Result<Vec<u8>>
        where F: FnMut(usize)
    {
        self.ensure_flash_mode()?;
        info!("reading..");
        let mut buf = vec![0; len];
        self.flash().read_into(offset, &mut buf, progress)?;
        Ok(buf)
    }

    /// Load a bitstream straight into configuration SRAM.  Returns the status read afterwards.
    pub fn program_sram<R: Read>(&mut self, reader: R) -> Result<DecodedStatus> {
        self.program_sram_with_progress(reader, |_| {})
    }

    pub fn program_sram_with_progress<R, F>(&mut self, mut reader: R, mut progress: F)
        -> Result<DecodedStatus>
        where R: Read,
              F: FnMut(usize)
    {
        info!("reset..");
        self.command8(Instruction::IscEnable, 0)?;
        self.command8(Instruction::IscErase, 0)?;
        self.command8(Instruction::LscResetCrc, 0)?;
        self.read_status()?;

        info!("programming..");
        self.command(Instruction::LscBitstreamBurst)?;
        self.jtag.go_to_state(TapState::ShiftDR)?;
        let mut buf = vec![0u8; SRAM_CHUNK];
        let mut total = 0;
        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            debug!("sending {} bytes", n);
            let chunk = &mut buf[..n];
            for b in chunk.iter_mut() {
                *b = b.reverse_bits();
            }
            self.jtag.shift_out(chunk, n * 8, false)?;
            total += n;
            progress(total);
        }
        self.jtag.flush()?;

        self.command(Instruction::IscDisable)?;
        self.flash_mode = false;
        self.read_status()
    }

    /// Reload the FPGA from flash, like pulsing PROGRAMN.
    pub fn reinitialize(&mut self) -> Result<()> {
        info!("rebooting ECP5...");
        self.command(Instruction::LscRefresh)?;
        self.flash_mode = false;
        Ok(())
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
