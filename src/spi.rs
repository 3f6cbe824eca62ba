//! SPI flash access tunnelled through the FPGA's JTAG port.
//!
//! Once background SPI is unlocked, every bit shifted through Shift-DR is passed to the
//! configuration flash.  Chip select follows the TAP: it is asserted while the TAP sits in
//! Shift-DR and released when it leaves.  JTAG shifts LSB first while SPI flashes expect MSB
//! first, so each byte is bit-reversed on the way in and out.
use crate::cable::Cable;
use crate::error::Result;
use crate::lattice::Instruction;
use crate::statemachine::{JtagSM, Register, TapState};

/// Key shifted into DR after `LSC_BACKGROUND_SPI` to enable the pass-through.
pub const BACKGROUND_SPI_KEY: [u8; 2] = [0xFE, 0x68];

fn reverse_all(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = b.reverse_bits();
    }
}

impl<T, U> JtagSM<T>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized
{
    /// Full-duplex SPI transfer that finishes the transaction: chip select is released
    /// afterwards.  `buf` holds MOSI bytes on entry and MISO bytes on return.
    pub fn xfer_spi(&mut self, buf: &mut [u8]) -> Result<()> {
        reverse_all(buf);
        if self.state() != TapState::ShiftDR {
            self.go_to_state(TapState::ShiftDR)?;
        }
        let bits = buf.len() * 8;
        let res = self.shift(buf, bits, true);
        reverse_all(buf);
        res
    }

    /// Full-duplex SPI transfer that keeps chip select asserted, so a later `send_spi` or
    /// `xfer_spi` continues the same transaction.
    pub fn send_spi(&mut self, buf: &mut [u8]) -> Result<()> {
        reverse_all(buf);
        self.go_to_state(TapState::ShiftDR)?;
        let bits = buf.len() * 8;
        let res = self.shift(buf, bits, false);
        reverse_all(buf);
        res
    }

    /// Unlock the SPI pass-through.  Has to happen once before any flash command.
    pub fn enter_spi_background_mode(&mut self) -> Result<()> {
        self.write_reg(Register::Instruction, &[Instruction::LscBackgroundSpi as u8],
            Instruction::LscBackgroundSpi.ir_bits())?;
        self.write_reg(Register::Data, &BACKGROUND_SPI_KEY, 16)?;
        self.go_to_state(TapState::Idle)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::SimCable;

    #[test]
    fn reversal_is_an_involution() {
        for b in 0..=255u8 {
            let mut v = [b];
            reverse_all(&mut v);
            reverse_all(&mut v);
            assert_eq!(v[0], b);
        }
        let mut v = [0x01, 0x80, 0x06];
        reverse_all(&mut v);
        assert_eq!(v, [0x80, 0x01, 0x60]);
    }

    #[test]
    fn xfer_twice_over_loopback() {
        let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        let orig = [0x9F, 0x00, 0x12, 0xFE];
        let mut buf = orig;
        jtag.xfer_spi(&mut buf).unwrap();
        jtag.xfer_spi(&mut buf).unwrap();
        assert_eq!(buf, orig);
        assert_eq!(jtag.state(), TapState::Exit1DR);
    }

    #[test]
    fn send_holds_shift_dr() {
        let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        let mut buf = [0x03, 0x00, 0x10, 0x00];
        jtag.send_spi(&mut buf).unwrap();
        assert_eq!(jtag.state(), TapState::ShiftDR);
        jtag.cable.clear_log();
        let mut more = [0u8; 4];
        jtag.send_spi(&mut more).unwrap();
        // continuing in Shift-DR needs no TMS moves
        assert_eq!(jtag.cable.clocks().len(), 32);
        assert!(jtag.cable.tms_bits().iter().all(|&t| !t));
    }

    #[test]
    fn xfer_continues_a_held_transaction() {
        let mut jtag = JtagSM::new(Box::new(SimCable::loopback())).unwrap();
        let mut header = [0x03, 0, 0, 0];
        jtag.send_spi(&mut header).unwrap();
        jtag.cable.clear_log();
        let mut tail = [0u8; 2];
        jtag.xfer_spi(&mut tail).unwrap();
        let tms = jtag.cable.tms_bits();
        assert_eq!(tms.len(), 16);
        assert!(tms[15]);
        assert!(tms[..15].iter().all(|&t| !t));
    }

    #[test]
    fn background_mode_key_reaches_the_device() {
        let mut jtag = JtagSM::new(Box::new(SimCable::new(Default::default()))).unwrap();
        jtag.enter_spi_background_mode().unwrap();
        assert!(jtag.cable.spi_enabled());
        assert_eq!(jtag.state(), TapState::Idle);
        assert_eq!(jtag.cable.instructions(), vec![0x3A]);
    }
}
