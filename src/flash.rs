//! SPI NOR flash engine on top of the SPI-over-JTAG bridge.
use std::fmt;
use std::ops::Range;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use log::{debug, info, trace, warn};

use crate::cable::Cable;
use crate::error::{Error, Result};
use crate::statemachine::{JtagSM, TapState};

/// SPI flash commands
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatus1 = 0x05,
    ReadStatus2 = 0x35,
    WriteStatus1 = 0x01,
    ReadJedecId = 0x9F,
    ReadData = 0x03,
    PageProgram = 0x02,
    SectorErase4K = 0x20,
    BlockErase32K = 0x52,
    BlockErase64K = 0xD8,
    ChipErase = 0xC7,
}

pub const PAGE_SIZE: u32 = 256;

/// Commands carry a 3-byte address, so nothing past 16 MiB is reachable.
pub const ADDRESS_SPACE: u64 = 1 << 24;

pub const STATUS_BUSY: u8 = 0x01;
pub const STATUS_WEL: u8 = 0x02;

/// Clear status reads in a row before an operation counts as finished.
const READY_READS: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseBlock {
    Sector4K,
    Block32K,
    Block64K,
}

impl EraseBlock {
    pub fn size(self) -> u32 {
        match self {
            EraseBlock::Sector4K => 0x1000,
            EraseBlock::Block32K => 0x8000,
            EraseBlock::Block64K => 0x10000,
        }
    }

    pub fn command(self) -> Command {
        match self {
            EraseBlock::Sector4K => Command::SectorErase4K,
            EraseBlock::Block32K => Command::BlockErase32K,
            EraseBlock::Block64K => Command::BlockErase64K,
        }
    }

    pub fn from_kib(kib: u32) -> Result<Self> {
        match kib {
            4 => Ok(EraseBlock::Sector4K),
            32 => Ok(EraseBlock::Block32K),
            64 => Ok(EraseBlock::Block64K),
            _ => Err(Error::InvalidArgument(format!(
                "erase size must be 4, 32 or 64 kB, not {}", kib))),
        }
    }
}

impl fmt::Display for EraseBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kB", self.size() / 1024)
    }
}

/// Block-aligned range covering `[offset, offset + len)`.  It may reach past both ends of the
/// requested range.
pub fn erase_range(offset: u32, len: u32, block: EraseBlock) -> Range<u32> {
    let mask = block.size() - 1;
    let start = offset & !mask;
    if len == 0 {
        return start..start;
    }
    let end = (offset as u64 + len as u64 + mask as u64) & !(mask as u64);
    start..end.min(u32::MAX as u64 & !(mask as u64)) as u32
}

/// Splits a write so that no piece crosses a page boundary.  Yields the flash address of each
/// piece and its range within the source buffer.
#[derive(Clone, Debug)]
pub struct PageSegments {
    address: u32,
    pos: usize,
    len: usize,
}

pub fn page_segments(address: u32, len: usize) -> PageSegments {
    PageSegments { address, pos: 0, len }
}

impl Iterator for PageSegments {
    type Item = (u32, Range<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.len {
            return None;
        }
        let addr = self.address.wrapping_add(self.pos as u32);
        let room = (PAGE_SIZE - addr % PAGE_SIZE) as usize;
        let n = room.min(self.len - self.pos);
        let range = self.pos..self.pos + n;
        self.pos += n;
        Some((addr, range))
    }
}

#[derive(Clone, Debug)]
pub struct FlashConfig {
    pub erase_block: EraseBlock,
    /// Read back every page right after programming it.
    pub interleaved_verify: bool,
    pub read_block_size: usize,
    pub poll_interval: Duration,
    /// Give up with `Error::BusyTimeout` after this many status polls.  `None` waits forever.
    pub max_polls: Option<u32>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            erase_block: EraseBlock::Block64K,
            interleaved_verify: false,
            read_block_size: 256 * 32,
            poll_interval: Duration::from_millis(1),
            max_polls: None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JedecId {
    pub manufacturer: u8,
    pub device: u16,
}

impl fmt::Display for JedecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} 0x{:02X} 0x{:02X}",
            self.manufacturer, self.device >> 8, self.device & 0xFF)
    }
}

/// Fails with `Error::InvalidArgument` unless `[offset, offset + len)` lies inside the flash
/// address space.
pub fn check_range(offset: u32, len: usize) -> Result<()> {
    if offset as u64 + len as u64 > ADDRESS_SPACE {
        return Err(Error::InvalidArgument(format!(
            "0x{:X} bytes at 0x{:06X} runs past the end of the 24-bit flash address space",
            len, offset)));
    }
    Ok(())
}

fn addressed(cmd: Command, addr: u32) -> [u8; 4] {
    [cmd as u8, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

pub struct SpiFlash<'a, T, D> {
    jtag: &'a mut JtagSM<T>,
    delay: &'a mut D,
    config: &'a FlashConfig,
}

impl<'a, T, U, D> SpiFlash<'a, T, D>
    where T: core::ops::DerefMut<Target=U>,
          U: Cable + ?Sized,
          D: DelayNs
{
    /// The background SPI port must already be unlocked.
    pub fn new(jtag: &'a mut JtagSM<T>, delay: &'a mut D, config: &'a FlashConfig) -> Self {
        Self { jtag, delay, config }
    }

    /// Clock out runs of ones with chip select toggled in between, which takes the flash out of
    /// continuous-read and QPI modes.
    pub fn reset(&mut self) -> Result<()> {
        let ones = [0xFF; 8];
        for bits in [64, 2, 8] {
            self.jtag.go_to_state(TapState::ShiftDR)?;
            self.jtag.shift_out(&ones, bits, true)?;
        }
        self.jtag.flush()
    }

    pub fn read_jedec_id(&mut self) -> Result<JedecId> {
        let mut buf = [Command::ReadJedecId as u8, 0, 0, 0];
        self.jtag.xfer_spi(&mut buf)?;
        Ok(JedecId {
            manufacturer: buf[1],
            device: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    pub fn read_status1(&mut self) -> Result<u8> {
        let mut buf = [Command::ReadStatus1 as u8, 0];
        self.jtag.xfer_spi(&mut buf)?;
        trace!("SR1: 0x{:02X}", buf[1]);
        Ok(buf[1])
    }

    pub fn read_status2(&mut self) -> Result<u8> {
        let mut buf = [Command::ReadStatus2 as u8, 0];
        self.jtag.xfer_spi(&mut buf)?;
        Ok(buf[1])
    }

    /// Log both status registers, bit by bit.
    pub fn log_status(&mut self) -> Result<()> {
        let sr1 = self.read_status1()?;
        let sr2 = self.read_status2()?;
        debug!("SR1: 0x{:02X} (busy {}, write enable {}, block protect {:03b}, top/bottom {}, \
                sector protect {}, status protect {})",
            sr1, sr1 & 1, (sr1 >> 1) & 1, (sr1 >> 2) & 7, (sr1 >> 5) & 1, (sr1 >> 6) & 1, sr1 >> 7);
        debug!("SR2: 0x{:02X} (status lock {}, quad enable {}, security locks {:03b}, \
                complement protect {}, suspend {})",
            sr2, sr2 & 1, (sr2 >> 1) & 1, (sr2 >> 3) & 7, (sr2 >> 6) & 1, sr2 >> 7);
        Ok(())
    }

    pub fn write_enable(&mut self) -> Result<()> {
        trace!("write enable");
        let mut buf = [Command::WriteEnable as u8];
        self.jtag.xfer_spi(&mut buf)
    }

    /// Poll status register 1 until the busy bit reads clear three times in a row.
    pub fn wait_ready(&mut self) -> Result<()> {
        let mut clear = 0;
        let mut polls = 0;
        loop {
            let sr1 = self.read_status1()?;
            polls += 1;
            if sr1 & STATUS_BUSY == 0 {
                clear += 1;
                if clear >= READY_READS {
                    break;
                }
            } else {
                clear = 0;
            }
            if let Some(max) = self.config.max_polls {
                if polls >= max {
                    return Err(Error::BusyTimeout { polls });
                }
            }
            self.delay.delay_us(self.config.poll_interval.as_micros() as u32);
        }
        trace!("ready after {} polls", polls);
        Ok(())
    }

    pub fn erase_block(&mut self, block: EraseBlock, addr: u32) -> Result<()> {
        check_range(addr, block.size() as usize)?;
        debug!("erase {} sector at 0x{:06X}..", block, addr);
        self.write_enable()?;
        let mut buf = addressed(block.command(), addr);
        self.jtag.xfer_spi(&mut buf)?;
        self.wait_ready()
    }

    /// Erase every block touching `[offset, offset + len)` and return the range actually erased.
    pub fn erase(&mut self, offset: u32, len: u32) -> Result<Range<u32>> {
        check_range(offset, len as usize)?;
        let block = self.config.erase_block;
        let range = erase_range(offset, len, block);
        info!("erasing 0x{:06X}..0x{:06X} in {} blocks", range.start, range.end, block);
        for addr in range.clone().step_by(block.size() as usize) {
            self.erase_block(block, addr)?;
        }
        Ok(range)
    }

    pub fn chip_erase(&mut self) -> Result<()> {
        info!("bulk erase..");
        self.write_enable()?;
        let mut buf = [Command::ChipErase as u8];
        self.jtag.xfer_spi(&mut buf)?;
        self.wait_ready()
    }

    /// Clear the block protection bits in status register 1.
    pub fn disable_protection(&mut self) -> Result<()> {
        self.write_enable()?;
        let mut buf = [Command::WriteStatus1 as u8, 0x00];
        self.jtag.xfer_spi(&mut buf)?;
        self.wait_ready()?;
        let sr1 = self.read_status1()?;
        if sr1 != 0 {
            warn!("failed to disable protection, SR now equal to 0x{:02x} (expected 0x00)", sr1);
        }
        Ok(())
    }

    /// Program one piece that lies within a single page.  Write enable and busy-wait are the
    /// caller's job.
    pub fn page_program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        debug_assert!((addr % PAGE_SIZE) as usize + data.len() <= PAGE_SIZE as usize);
        check_range(addr, data.len())?;
        trace!("prog 0x{:06X} +0x{:03X}..", addr, data.len());
        let mut header = addressed(Command::PageProgram, addr);
        self.jtag.send_spi(&mut header)?;
        let mut buf = data.to_vec();
        self.jtag.xfer_spi(&mut buf)
    }

    pub fn program(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.program_with_progress(offset, data, |_| {})
    }

    /// Program `data` at `offset`, reporting bytes done after each page.
    pub fn program_with_progress<F>(&mut self, offset: u32, data: &[u8], mut progress: F)
        -> Result<()>
        where F: FnMut(usize)
    {
        check_range(offset, data.len())?;
        for (addr, range) in page_segments(offset, data.len()) {
            let piece = &data[range.clone()];
            self.write_enable()?;
            self.page_program(addr, piece)?;
            self.wait_ready()?;
            if self.config.interleaved_verify {
                self.verify(addr, piece)?;
            }
            progress(range.end);
        }
        Ok(())
    }

    pub fn read(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_into(offset, &mut buf, |_| {})?;
        Ok(buf)
    }

    /// Read `buf.len()` bytes in one transaction.  Chip select stays asserted until the last
    /// block, which is shifted with an exit so the transaction ends.
    pub fn read_into<F>(&mut self, offset: u32, buf: &mut [u8], mut progress: F) -> Result<()>
        where F: FnMut(usize)
    {
        check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        trace!("read 0x{:06X} +0x{:X}..", offset, buf.len());
        let mut header = addressed(Command::ReadData, offset);
        self.jtag.send_spi(&mut header)?;

        let block = self.config.read_block_size.max(1);
        let total = buf.len();
        let mut done = 0;
        for chunk in buf.chunks_mut(block) {
            chunk.fill(0);
            done += chunk.len();
            if done < total {
                self.jtag.send_spi(chunk)?;
            } else {
                self.jtag.xfer_spi(chunk)?;
            }
            progress(done);
        }
        Ok(())
    }

    pub fn verify(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.verify_with_progress(offset, data, |_| {})
    }

    /// Read back and compare.  The error carries the first differing address.
    pub fn verify_with_progress<F>(&mut self, offset: u32, data: &[u8], progress: F)
        -> Result<()>
        where F: FnMut(usize)
    {
        let mut buf = vec![0; data.len()];
        self.read_into(offset, &mut buf, progress)?;
        match buf.iter().zip(data).position(|(a, b)| a != b) {
            Some(i) => Err(Error::VerifyMismatch { address: offset + i as u32 }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{NoDelay, SimCable, SimConfig};
    use crate::cable::sim::nor::FlashOp;
    use proptest::prelude::*;

    fn unlocked(config: SimConfig) -> JtagSM<Box<SimCable>> {
        let mut jtag = JtagSM::new(Box::new(SimCable::new(config))).unwrap();
        jtag.enter_spi_background_mode().unwrap();
        jtag
    }

    #[test]
    fn erase_alignment() {
        assert_eq!(erase_range(0x00F000, 0x2000, EraseBlock::Block64K), 0x000000..0x010000);
        assert_eq!(erase_range(0x00F000, 0x2000, EraseBlock::Sector4K), 0x00F000..0x011000);
        assert_eq!(erase_range(0, 99302, EraseBlock::Block64K), 0..0x20000);
        assert_eq!(erase_range(0x10000, 0x10000, EraseBlock::Block32K), 0x10000..0x20000);
    }

    #[test]
    fn page_split() {
        let segs: Vec<_> = page_segments(0x0FE, 0x144).collect();
        assert_eq!(segs, vec![(0x0FE, 0..2), (0x100, 2..0x102), (0x200, 0x102..0x144)]);
    }

    #[test]
    fn erase_block_from_kib() {
        assert_eq!(EraseBlock::from_kib(32).unwrap(), EraseBlock::Block32K);
        assert!(EraseBlock::from_kib(16).is_err());
    }

    #[test]
    fn busy_needs_three_clear_reads_in_a_row() {
        let mut jtag = unlocked(SimConfig { busy_polls: 0, ..Default::default() });
        jtag.cable.flash_mut().queue_busy_pattern(&[true, false, false, true, false, false]);
        let config = FlashConfig::default();
        let mut delay = NoDelay;
        let before = jtag.cable.flash().status_reads();
        SpiFlash::new(&mut jtag, &mut delay, &config).wait_ready().unwrap();
        // pattern of six, then one more clear read from the idle part
        assert_eq!(jtag.cable.flash().status_reads() - before, 7);
    }

    #[test]
    fn bounded_wait_times_out() {
        let mut jtag = unlocked(SimConfig { busy_polls: 0, ..Default::default() });
        jtag.cable.flash_mut().queue_busy_pattern(&[true; 20]);
        let config = FlashConfig { max_polls: Some(5), ..Default::default() };
        let mut delay = NoDelay;
        let res = SpiFlash::new(&mut jtag, &mut delay, &config).wait_ready();
        assert!(matches!(res, Err(Error::BusyTimeout { polls: 5 })));
    }

    #[test]
    fn jedec_id_and_reset() {
        let mut jtag = unlocked(SimConfig::default());
        let config = FlashConfig::default();
        let mut delay = NoDelay;
        let mut flash = SpiFlash::new(&mut jtag, &mut delay, &config);
        flash.reset().unwrap();
        let id = flash.read_jedec_id().unwrap();
        assert_eq!(id, JedecId { manufacturer: 0xEF, device: 0x4018 });
        assert_eq!(id.to_string(), "0xEF 0x40 0x18");
    }

    #[test]
    fn program_splits_pages_and_reads_back() {
        let mut jtag = unlocked(SimConfig::default());
        let config = FlashConfig { read_block_size: 100, ..Default::default() };
        let mut delay = NoDelay;
        let data: Vec<u8> = (0..0x144).map(|i| (i * 3) as u8).collect();
        {
            let mut flash = SpiFlash::new(&mut jtag, &mut delay, &config);
            flash.program(0x0FE, &data).unwrap();
            assert_eq!(flash.read(0x0FE, data.len()).unwrap(), data);
            flash.verify(0x0FE, &data).unwrap();
        }
        assert_eq!(jtag.cable.flash().ops(), &[
            FlashOp::Program { address: 0x0FE, len: 2 },
            FlashOp::Program { address: 0x100, len: 0x100 },
            FlashOp::Program { address: 0x200, len: 0x42 },
        ]);
        assert!(!jtag.cable.flash().is_selected());
    }

    #[test]
    fn verify_reports_first_difference() {
        let mut jtag = unlocked(SimConfig::default());
        jtag.cable.flash_mut().memory_mut()[0x1003] = 0x00;
        let config = FlashConfig::default();
        let mut delay = NoDelay;
        let data = vec![0xFF; 16];
        let res = SpiFlash::new(&mut jtag, &mut delay, &config).verify(0x1000, &data);
        assert!(matches!(res, Err(Error::VerifyMismatch { address: 0x1003 })));
    }

    #[test]
    fn erase_issues_one_command_per_block() {
        let mut jtag = unlocked(SimConfig::default());
        let config = FlashConfig { erase_block: EraseBlock::Sector4K, ..Default::default() };
        let mut delay = NoDelay;
        let range = SpiFlash::new(&mut jtag, &mut delay, &config).erase(0x1800, 0x1000).unwrap();
        assert_eq!(range, 0x1000..0x3000);
        assert_eq!(jtag.cable.flash().ops(), &[
            FlashOp::Erase { address: 0x1000, size: 0x1000 },
            FlashOp::Erase { address: 0x2000, size: 0x1000 },
        ]);
    }

    #[test]
    fn protection_cleared() {
        let mut jtag = unlocked(SimConfig::default());
        jtag.cable.flash_mut().set_status1(0x1C);
        let config = FlashConfig::default();
        let mut delay = NoDelay;
        SpiFlash::new(&mut jtag, &mut delay, &config).disable_protection().unwrap();
        assert_eq!(jtag.cable.flash().status1(), 0);
        assert_eq!(jtag.cable.flash().ops(), &[FlashOp::WriteStatus(0)]);
    }

    #[test]
    fn last_page_is_reachable_but_nothing_past_it() {
        let mut jtag = unlocked(SimConfig::default());
        let config = FlashConfig { erase_block: EraseBlock::Sector4K, ..Default::default() };
        let mut delay = NoDelay;
        let data = vec![0x3C; 0x100];
        {
            let mut flash = SpiFlash::new(&mut jtag, &mut delay, &config);
            assert_eq!(flash.erase(0xFFFF00, 0x100).unwrap(), 0xFFF000..0x1000000);
            flash.program(0xFFFF00, &data).unwrap();
            flash.verify(0xFFFF00, &data).unwrap();

            let too_long = vec![0x3C; 0x101];
            assert!(matches!(flash.program(0xFFFF00, &too_long), Err(Error::InvalidArgument(_))));
            assert!(matches!(flash.verify(0xFFFF00, &too_long), Err(Error::InvalidArgument(_))));
            assert!(matches!(flash.erase(0xFFFF00, 0x101), Err(Error::InvalidArgument(_))));
            assert!(matches!(flash.erase(0x1000000, 1), Err(Error::InvalidArgument(_))));
            assert!(matches!(flash.read(0x1000000, 1), Err(Error::InvalidArgument(_))));
            assert!(matches!(flash.program(u32::MAX - 3, &data), Err(Error::InvalidArgument(_))));
        }
        // block 0 is untouched and no rejected request reached the part
        assert_eq!(jtag.cable.flash().ops(), &[
            FlashOp::Erase { address: 0xFFF000, size: 0x1000 },
            FlashOp::Program { address: 0xFFFF00, len: 0x100 },
        ]);
        assert!(jtag.cable.flash().memory()[..0x1000].iter().all(|&b| b == 0xFF));
        assert!(check_range(0, ADDRESS_SPACE as usize).is_ok());
    }

    #[test]
    fn segments_near_the_top_of_u32_do_not_overflow() {
        let segs: Vec<_> = page_segments(u32::MAX - 1, 4).collect();
        assert_eq!(segs, vec![(u32::MAX - 1, 0..2), (0, 2..4)]);
    }

    proptest! {
        #[test]
        fn segments_cover_input_without_crossing_pages(addr in 0u32..0x100000, len in 0usize..2000) {
            let mut next = 0;
            for (a, r) in page_segments(addr, len) {
                prop_assert_eq!(r.start, next);
                prop_assert_eq!(a, addr + r.start as u32);
                prop_assert!(!r.is_empty());
                prop_assert!((a % PAGE_SIZE) as usize + r.len() <= PAGE_SIZE as usize);
                next = r.end;
            }
            prop_assert_eq!(next, len);
        }

        #[test]
        fn erase_range_covers_request(offset in 0u32..0x1000000, len in 1u32..0x100000) {
            for block in [EraseBlock::Sector4K, EraseBlock::Block32K, EraseBlock::Block64K] {
                let r = erase_range(offset, len, block);
                prop_assert!(r.start <= offset);
                prop_assert!(r.end >= offset + len);
                prop_assert_eq!(r.start % block.size(), 0);
                prop_assert_eq!(r.end % block.size(), 0);
                prop_assert!(r.end - r.start < len + 2 * block.size());
            }
        }
    }
}
