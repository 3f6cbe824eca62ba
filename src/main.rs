//! ecp-jtag - program Lattice ECP5/NX FPGAs and their configuration flash
//!
//! Every run identifies the FPGA and prints its status register first, then does what the
//! subcommand asks.  Errors are mapped to the exit status: 1 for bad arguments or files, 2 for
//! anything that went wrong talking to the hardware, 3 for a failed verify.

mod cli;

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};

use cli::{Cli, Commands};
use ecp_jtag::cable::CableConfig;
use ecp_jtag::flash::{EraseBlock, FlashConfig};
use ecp_jtag::programmer::Programmer;
use ecp_jtag::{Error, Result};

const SLOW_DIVIDER: u32 = 30;

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if is_stdio(path) {
        let mut data = Vec::new();
        io::stdin().lock().read_to_end(&mut data)?;
        Ok(data)
    } else {
        Ok(fs::read(path)?)
    }
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    if is_stdio(path) {
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()?;
    } else {
        fs::write(path, data)?;
    }
    Ok(())
}

fn end_of(offset: u32, len: usize) -> Result<u32> {
    u32::try_from(len).ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| Error::InvalidArgument(format!(
            "{} bytes at offset 0x{:06X} is past the end of the address space", len, offset)))
}

fn run(cli: Cli) -> Result<()> {
    let cable = CableConfig {
        interface: cli.interface,
        device: cli.device.clone(),
        clock_divider: if cli.slow { SLOW_DIVIDER } else { cli.divider.unwrap_or(1) },
    };
    cable.validate()?;

    let mut flash = FlashConfig::default();
    match &cli.command {
        Commands::Write { erase_size, interleaved_verify, .. } => {
            flash.erase_block = EraseBlock::from_kib(*erase_size)?;
            flash.interleaved_verify = *interleaved_verify;
        }
        Commands::Erase { erase_size, .. } => {
            flash.erase_block = EraseBlock::from_kib(*erase_size)?;
        }
        _ => {}
    }

    // Load input files before touching the hardware.
    let input = match &cli.command {
        Commands::Write { file, .. } | Commands::Verify { file, .. } | Commands::Sram { file } =>
            Some(read_input(file)?),
        _ => None,
    };
    let input = input.unwrap_or_default();
    let reinit = cli.reinit;

    let mut prog = Programmer::initialize(&cli.cable, &cable, flash)?;
    prog.identify()?;
    prog.read_status()?;

    match cli.command {
        Commands::Probe => {
            prog.enter_flash_mode()?;
        }
        Commands::Write { offset, bulk_erase, no_erase, no_verify, interleaved_verify, unprotect, .. } => {
            let offset = offset.offset;
            let end = end_of(offset, input.len())?;
            if unprotect {
                prog.disable_protection()?;
            }
            if bulk_erase {
                info!("bulk erase..");
                prog.bulk_erase()?;
            } else if !no_erase {
                info!("erase..");
                let erased = prog.erase(offset..end)?;
                info!("erased 0x{:06X}..0x{:06X}", erased.start, erased.end);
            }

            let pb = progress_bar(input.len());
            prog.program_with_progress(offset, &input, |n| pb.set_position(n as u64))?;
            pb.finish_and_clear();
            info!("programmed {} bytes at 0x{:06X}", input.len(), offset);

            if !no_verify && !interleaved_verify {
                let pb = progress_bar(input.len());
                let result = prog.verify_with_progress(offset, &input, |n| pb.set_position(n as u64));
                pb.finish_and_clear();
                result?;
            }
        }
        Commands::Verify { offset, .. } => {
            let pb = progress_bar(input.len());
            let result = prog.verify_with_progress(offset.offset, &input, |n| pb.set_position(n as u64));
            pb.finish_and_clear();
            result?;
        }
        Commands::Read { file, offset, size } => {
            let pb = progress_bar(size as usize);
            let data = prog.read_with_progress(offset.offset, size as usize,
                |n| pb.set_position(n as u64))?;
            pb.finish_and_clear();
            write_output(&file, &data)?;
            info!("read {} bytes from 0x{:06X}", data.len(), offset.offset);
        }
        Commands::Erase { size, bulk, offset, .. } => {
            if bulk {
                info!("bulk erase..");
                prog.bulk_erase()?;
            } else {
                let size = size.unwrap_or(0);
                let end = end_of(offset.offset, size as usize)?;
                let erased = prog.erase(offset.offset..end)?;
                info!("erased 0x{:06X}..0x{:06X}", erased.start, erased.end);
            }
        }
        Commands::Sram { .. } => {
            let pb = progress_bar(input.len());
            let status = prog.program_sram_with_progress(input.as_slice(), |n| pb.set_position(n as u64))?;
            pb.finish_and_clear();
            if !status.done() {
                error!("DONE is not set after loading the bitstream");
            }
        }
    }

    if reinit {
        prog.reinitialize()?;
    }
    info!("Bye.");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG still wins over -v
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // The programmer, and with it the cable, is dropped before the process exits.
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
