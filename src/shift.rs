//! Shifting data through the instruction and data registers.
//!
//! Whole bytes are clocked with the MPSSE byte commands, which keep TMS low and so never move the
//! TAP.  The last byte is clocked bit-wise, and when the shift has to leave Shift-DR/IR its final
//! bit goes out with a TMS command instead so the exit happens on exactly that clock.
use ftdi_mpsse::{ClockBits, ClockBitsOut, ClockData, ClockDataOut, ClockTMS, ClockTMSOut};
use ftdi_mpsse::MpsseCmdBuilder;
use log::trace;

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::statemachine::{JtagSM, Register, TapState};

/// Whole bytes per read-write round trip, leaving room in the adapter's receive buffer for the
/// bytes of the final partial unit.
pub const MAX_BATCH: usize = 4094;

/// Largest payload of a single MPSSE byte command.
const MAX_BYTES_PER_CMD: usize = 65536;

// Clock-only opcodes: n+1 bits, and (n+1)*8 bits.  TMS and TDI hold their levels.
const CLOCK_BITS_NO_DATA: u8 = 0x8E;
const CLOCK_BYTES_NO_DATA: u8 = 0x8F;

/// Split a shift of `bits` into whole bytes and the bits clocked individually at the end.  With
/// `must_end` there is always at least one trailing bit, since the last one carries TMS.
fn split_bits(bits: usize, must_end: bool) -> (usize, usize) {
    let rem = bits % 8;
    if must_end && rem == 0 {
        (bits / 8 - 1, 8)
    } else {
        (bits / 8, rem)
    }
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    fn check_len(data_len: usize, bits: usize) -> Result<()> {
        if bits > data_len * 8 {
            return Err(Error::InvalidArgument(format!(
                "shift of {} bits from a {} byte buffer", bits, data_len)));
        }
        Ok(())
    }

    /// Shift `bits` of `data` out on TDI, LSB first, replacing them with the bits captured on
    /// TDO.  Must be called in Shift-DR or Shift-IR.  When `must_end` is set, the last bit is
    /// clocked with TMS high and the TAP moves to Exit1-DR/IR.
    pub fn shift(&mut self, data: &mut [u8], bits: usize, must_end: bool) -> Result<()> {
        Self::check_len(data.len(), bits)?;
        if bits == 0 {
            return Ok(());
        }
        debug_assert!(self.state().is_shift());

        let (whole, tail) = split_bits(bits, must_end);
        let (bytes, last) = data.split_at_mut(whole);

        let mut batches = bytes.chunks_mut(MAX_BATCH).peekable();
        while let Some(batch) = batches.next() {
            let builder = MpsseCmdBuilder::new().clock_data(ClockData::LsbPosIn, batch);
            self.queue(builder.as_slice())?;
            if batches.peek().is_some() {
                self.queue(MpsseCmdBuilder::new().send_immediate().as_slice())?;
                self.flush()?;
                self.cable.read_exact(batch)?;
                continue;
            }
            if tail == 0 {
                self.queue(MpsseCmdBuilder::new().send_immediate().as_slice())?;
                self.flush()?;
                self.cable.read_exact(batch)?;
                return Ok(());
            }
            let mut resp = [0u8; 2];
            let n = self.queue_tail(last[0], tail, must_end)?;
            self.flush()?;
            self.cable.read_exact(batch)?;
            self.cable.read_exact(&mut resp[..n])?;
            last[0] = unpack_tail(&resp[..n], tail, must_end);
            return Ok(());
        }

        // Nothing but the final partial byte.
        let mut resp = [0u8; 2];
        let n = self.queue_tail(last[0], tail, must_end)?;
        self.flush()?;
        self.cable.read_exact(&mut resp[..n])?;
        last[0] = unpack_tail(&resp[..n], tail, must_end);
        Ok(())
    }

    /// Queue the bit-wise commands for the last `tail` bits of `byte` and return how many response
    /// bytes they produce.
    fn queue_tail(&mut self, byte: u8, tail: usize, must_end: bool) -> Result<usize> {
        let mut builder = MpsseCmdBuilder::new();
        let mut responses = 0;
        let plain = if must_end { tail - 1 } else { tail };
        if plain > 0 {
            builder = builder.clock_bits(ClockBits::LsbPosIn, byte, plain as u8);
            responses += 1;
        }
        if must_end {
            let last_bit = byte & (1 << (tail - 1)) != 0;
            builder = builder.clock_tms(ClockTMS::NegTMSPosTDO, 1, last_bit, 1);
            responses += 1;
            self.tap.advance(true);
        }
        builder = builder.send_immediate();
        self.queue(builder.as_slice())?;
        Ok(responses)
    }

    /// Like `shift`, but nothing is read back.  Used for bulk writes where TDO is of no interest.
    pub fn shift_out(&mut self, data: &[u8], bits: usize, must_end: bool) -> Result<()> {
        Self::check_len(data.len(), bits)?;
        if bits == 0 {
            return Ok(());
        }
        debug_assert!(self.state().is_shift());

        let (whole, tail) = split_bits(bits, must_end);
        for chunk in data[..whole].chunks(MAX_BYTES_PER_CMD) {
            let builder = MpsseCmdBuilder::new().clock_data_out(ClockDataOut::LsbNeg, chunk);
            self.queue(builder.as_slice())?;
        }
        if tail > 0 {
            let byte = data[whole];
            let mut builder = MpsseCmdBuilder::new();
            let plain = if must_end { tail - 1 } else { tail };
            if plain > 0 {
                builder = builder.clock_bits_out(ClockBitsOut::LsbNeg, byte, plain as u8);
            }
            if must_end {
                let last_bit = byte & (1 << (tail - 1)) != 0;
                builder = builder.clock_tms_out(ClockTMSOut::NegEdge, 1, last_bit, 1);
                self.tap.advance(true);
            }
            self.queue(builder.as_slice())?;
        }
        trace!("shift_out: {} bits, must_end {}", bits, must_end);
        Ok(())
    }

    /// Clock TCK `clocks` times without moving the TAP.  Used to give the device time in
    /// Run-Test/Idle after a command.
    pub fn idle(&mut self, clocks: usize) -> Result<()> {
        debug_assert!(matches!(self.state(), TapState::Idle | TapState::PauseDR
            | TapState::PauseIR | TapState::Reset) || self.state().is_shift());
        let mut bytes = clocks / 8;
        while bytes > 0 {
            let n = bytes.min(0x10000);
            let len = (n - 1) as u16;
            self.queue(&[CLOCK_BYTES_NO_DATA, len as u8, (len >> 8) as u8])?;
            bytes -= n;
        }
        let bits = clocks % 8;
        if bits > 0 {
            self.queue(&[CLOCK_BITS_NO_DATA, (bits - 1) as u8])?;
        }
        Ok(())
    }

    fn enter_shift(&mut self, reg: Register) -> Result<()> {
        match reg {
            Register::Data => self.go_to_state(TapState::ShiftDR),
            Register::Instruction => self.go_to_state(TapState::ShiftIR),
        }
    }

    /// Write `bits` of `data` into either the instruction or data register, leaving the TAP in
    /// Exit1-IR/DR.
    pub fn write_reg(&mut self, reg: Register, data: &[u8], bits: usize) -> Result<()> {
        self.enter_shift(reg)?;
        self.shift_out(data, bits, true)
    }

    /// Read `bits` from either the instruction or data register, shifting in zeros.
    pub fn read_reg(&mut self, reg: Register, bits: usize) -> Result<Vec<u8>> {
        let mut data = vec![0; bits.div_ceil(8)];
        self.read_write_reg(reg, &mut data, bits)?;
        Ok(data)
    }

    /// Similar to `write_reg` except `data` is replaced by the bits that were shifted out.
    pub fn read_write_reg(&mut self, reg: Register, data: &mut [u8], bits: usize) -> Result<()> {
        self.enter_shift(reg)?;
        self.shift(data, bits, true)
    }
}

/// Reassemble the final byte from the responses to `queue_tail`.  MPSSE bit reads shift in from
/// the top, so n captured bits sit in the n most significant bits.
fn unpack_tail(resp: &[u8], tail: usize, must_end: bool) -> u8 {
    if must_end {
        let plain = tail - 1;
        let last = resp[resp.len() - 1] >> 7;
        if plain > 0 {
            (resp[0] >> (8 - plain)) | (last << plain)
        } else {
            last
        }
    } else {
        resp[0] >> (8 - tail)
    }
}
