use ecp_jtag::cable::sim::nor::FlashOp;
use ecp_jtag::cable::sim::{NoDelay, SimCable, SimConfig};
use ecp_jtag::cable::{Cable, CableConfig};
use ecp_jtag::flash::{EraseBlock, FlashConfig, JedecId};
use ecp_jtag::lattice::{Family, Instruction};
use ecp_jtag::programmer::Programmer;
use ecp_jtag::Error;

type SimProgrammer = Programmer<Box<SimCable>, NoDelay>;

fn programmer(config: FlashConfig) -> SimProgrammer {
    Programmer::new(Box::new(SimCable::new(SimConfig::default())), NoDelay, config).unwrap()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + (i >> 8)) as u8).collect()
}

fn program_ops(prog: &mut SimProgrammer) -> usize {
    prog.jtag().cable.flash().ops().iter()
        .filter(|op| matches!(op, FlashOp::Program { .. }))
        .count()
}

#[test]
fn erase_program_verify() {
    let mut prog = programmer(FlashConfig::default());
    let device = prog.identify().unwrap();
    assert_eq!(device.idcode, 0x41111043);
    assert_eq!(device.name, Some("LFE5U-25"));
    assert_eq!(device.family, Family::Ecp5);
    assert_eq!(prog.device(), Some(&device));
    assert_eq!(prog.config().erase_block, EraseBlock::Block64K);
    prog.read_status().unwrap();

    let data = image(99302);
    let erased = prog.erase(0..data.len() as u32).unwrap();
    assert_eq!(erased, 0..0x20000);
    assert_eq!(prog.jtag().cable.flash().ops(), &[
        FlashOp::Erase { address: 0, size: 0x10000 },
        FlashOp::Erase { address: 0x10000, size: 0x10000 },
    ]);

    let mut last = 0;
    prog.program_with_progress(0, &data, |n| last = n).unwrap();
    assert_eq!(last, data.len());
    assert_eq!(program_ops(&mut prog), (data.len() + 255) / 256);
    assert_eq!(&prog.jtag().cable.flash().memory()[..data.len()], &data[..]);

    prog.verify(0, &data).unwrap();
    assert_eq!(prog.read(0x100, 0x20).unwrap(), &data[0x100..0x120]);
}

#[test]
fn verify_reports_first_bad_address() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    let data = image(0x2000);
    prog.erase(0..0x2000).unwrap();
    prog.program(0, &data).unwrap();

    prog.jtag().cable.flash_mut().memory_mut()[0x1003] ^= 0x10;
    prog.jtag().cable.flash_mut().memory_mut()[0x1800] ^= 0x01;
    let err = prog.verify(0, &data).unwrap_err();
    assert!(matches!(err, Error::VerifyMismatch { address: 0x1003 }));
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn interleaved_verify_stops_at_bad_page() {
    let mut prog = programmer(FlashConfig { interleaved_verify: true, ..Default::default() });
    prog.identify().unwrap();
    // a cell that was never erased can't take the new value
    prog.jtag().cable.flash_mut().memory_mut()[0x300] = 0x00;
    let data = vec![0xA5; 0x1000];
    let err = prog.program(0, &data).unwrap_err();
    assert!(matches!(err, Error::VerifyMismatch { address: 0x300 }));
    assert_eq!(program_ops(&mut prog), 4);
}

#[test]
fn unaligned_write_spans_pages() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    let data = image(600);
    prog.erase(0x10F0..0x10F0 + 600).unwrap();
    prog.program(0x10F0, &data).unwrap();
    let ops: Vec<FlashOp> = prog.jtag().cable.flash().ops().iter()
        .filter(|op| matches!(op, FlashOp::Program { .. }))
        .cloned()
        .collect();
    assert_eq!(ops, vec![
        FlashOp::Program { address: 0x10F0, len: 16 },
        FlashOp::Program { address: 0x1100, len: 256 },
        FlashOp::Program { address: 0x1200, len: 256 },
        FlashOp::Program { address: 0x1300, len: 72 },
    ]);
    prog.verify(0x10F0, &data).unwrap();
}

#[test]
fn bulk_erase() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    prog.jtag().cable.flash_mut().memory_mut()[0x123456] = 0;
    prog.bulk_erase().unwrap();
    assert_eq!(prog.jtag().cable.flash().ops(), &[FlashOp::ChipErase]);
    assert!(prog.jtag().cable.flash().memory().iter().all(|&b| b == 0xFF));
}

#[test]
fn unprotect_clears_status() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    prog.jtag().cable.flash_mut().set_status1(0x1C);
    prog.disable_protection().unwrap();
    assert_eq!(prog.jtag().cable.flash().status1(), 0);
    assert_eq!(prog.jtag().cable.flash().ops(), &[FlashOp::WriteStatus(0)]);
}

#[test]
fn sram_load() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    let bitstream = image(40 * 1024 + 17);
    let mut progress = Vec::new();
    let status = prog.program_sram_with_progress(&bitstream[..], |n| progress.push(n)).unwrap();
    assert!(status.done());
    assert!(!status.fail());
    assert_ne!(prog.jtag().cable.status() & (1 << 8), 0);
    assert_eq!(progress, vec![16 * 1024, 32 * 1024, bitstream.len()]);
    assert_eq!(prog.jtag().cable.bitstream(), &bitstream[..]);

    let instructions = prog.jtag().cable.instructions();
    let burst = instructions.iter().position(|&i| i == Instruction::LscBitstreamBurst as u8).unwrap();
    assert_eq!(&instructions[1..burst], &[
        Instruction::IscEnable as u8,
        Instruction::IscErase as u8,
        Instruction::LscResetCrc as u8,
        Instruction::LscReadStatus as u8,
    ]);
    assert_eq!(&instructions[burst + 1..], &[
        Instruction::IscDisable as u8,
        Instruction::LscReadStatus as u8,
    ]);
}

#[test]
fn reinitialize_refreshes() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    prog.erase(0..0x100).unwrap();
    assert!(prog.jtag().cable.spi_enabled());
    prog.reinitialize().unwrap();
    assert_eq!(prog.jtag().cable.refreshes(), 1);
    assert!(!prog.jtag().cable.spi_enabled());

    // flash mode is entered again on the next flash operation
    prog.erase(0..0x100).unwrap();
    assert!(prog.jtag().cable.spi_enabled());
}

#[test]
fn initialize_by_name() {
    let mut prog = Programmer::initialize("sim", &CableConfig::default(), FlashConfig::default())
        .unwrap();
    assert_eq!(prog.identify().unwrap().name, Some("LFE5U-25"));
    assert!(!prog.read_status().unwrap().done());

    let err = Programmer::initialize("nope", &CableConfig::default(), FlashConfig::default());
    assert!(matches!(err, Err(Error::UnknownCable(_))));
    let bad_divider = CableConfig { clock_divider: 0, ..Default::default() };
    let err = Programmer::initialize("sim", &bad_divider, FlashConfig::default());
    assert!(matches!(err, Err(Error::InvalidArgument(_))));
}

#[test]
fn flash_id_without_touching_the_array() {
    let mut prog = programmer(FlashConfig::default());
    prog.identify().unwrap();
    prog.read_status().unwrap();
    let id = prog.enter_flash_mode().unwrap();
    assert_eq!(id, JedecId { manufacturer: 0xEF, device: 0x4018 });
    assert_eq!(id.to_string(), "0xEF 0x40 0x18");
    assert!(prog.jtag().cable.spi_enabled());
    assert!(prog.jtag().cable.flash().ops().is_empty());
}

#[test]
fn writes_past_16m_are_rejected() {
    let mut prog = programmer(FlashConfig { erase_block: EraseBlock::Sector4K, ..Default::default() });
    prog.identify().unwrap();
    let page = vec![0x5A; 0x100];
    prog.erase(0xFFFF00..0x1000000).unwrap();
    prog.program(0xFFFF00, &page).unwrap();
    prog.verify(0xFFFF00, &page).unwrap();

    let err = prog.program(0xFFFF00, &image(0x101)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(err.exit_code(), 1);
    assert!(matches!(prog.erase(0x1000000..0x1010000), Err(Error::InvalidArgument(_))));
    assert!(matches!(prog.verify(0x1000000, &page), Err(Error::InvalidArgument(_))));
    assert!(prog.jtag().cable.flash().memory()[..0x1000].iter().all(|&b| b == 0xFF));
    assert_eq!(program_ops(&mut prog), 1);
}

/// Passes everything through to the simulator until its write budget runs out.
struct Unplugged {
    sim: SimCable,
    writes_left: usize,
}

impl Cable for Unplugged {
    fn write_bytes(&mut self, data: &[u8]) -> ecp_jtag::Result<()> {
        if self.writes_left == 0 {
            return Err(Error::ShortWrite { written: 0, expected: data.len() });
        }
        self.writes_left -= 1;
        self.sim.write_bytes(data)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> ecp_jtag::Result<usize> {
        self.sim.read_bytes(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ecp_jtag::Result<()> {
        self.sim.read_exact(buf)
    }
}

#[test]
fn short_write_is_fatal() {
    let cable = Box::new(Unplugged { sim: SimCable::new(SimConfig::default()), writes_left: usize::MAX });
    let mut prog = Programmer::new(cable, NoDelay, FlashConfig::default()).unwrap();
    prog.identify().unwrap();

    // fails partway through entering flash mode
    prog.jtag().cable.writes_left = 3;
    let err = prog.erase(0..0x100).unwrap_err();
    assert!(matches!(err, Error::ShortWrite { written: 0, .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(prog.jtag().cable.sim.flash().ops().is_empty());

    // nothing recovers on its own
    assert!(matches!(prog.read_status(), Err(Error::ShortWrite { .. })));
}
