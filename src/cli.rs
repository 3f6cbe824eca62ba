//! CLI argument parsing

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use ecp_jtag::cable::Interface;

/// Parse a size or offset: decimal or `0x` hex, with an optional `k` or `M` suffix.
pub fn parse_size(s: &str) -> Result<u32, String> {
    let (digits, scale) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024),
        Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        digits.parse::<u32>()
    };
    let value = value.map_err(|e| format!("Invalid size `{}`: {}", s, e))?;
    value.checked_mul(scale).ok_or_else(|| format!("Size `{}` does not fit in 32 bits", s))
}

#[derive(Parser, Debug)]
#[command(name = "ecp-jtag")]
#[command(author, version, about = "Program Lattice ECP5/NX FPGAs and their SPI flash over FTDI JTAG", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Cable type [available: ftdi, sim]
    #[arg(long, default_value = "ftdi", global = true)]
    pub cable: String,

    /// Adapter to open: s:VID:PID:SERIAL or i:VID:PID[:INDEX]
    #[arg(short, long, global = true)]
    pub device: Option<String>,

    /// FTDI interface (A-D)
    #[arg(short = 'I', long, default_value = "A", global = true)]
    pub interface: Interface,

    /// Divide the 6 MHz TCK by this value (1-65536)
    #[arg(short = 'k', long, global = true, conflicts_with = "slow")]
    pub divider: Option<u32>,

    /// Run TCK at 200 kHz
    #[arg(short, long, global = true)]
    pub slow: bool,

    /// Reload the FPGA from flash when done
    #[arg(short = 'a', long, global = true)]
    pub reinit: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct OffsetArg {
    /// Flash offset (k and M suffixes allowed)
    #[arg(short, long, default_value = "0", value_parser = parse_size)]
    pub offset: u32,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read the IDCODE, the FPGA status register and the flash ID, then exit
    Probe,

    /// Erase, program and verify the flash
    Write {
        /// Input file, `-` for stdin
        file: PathBuf,

        #[command(flatten)]
        offset: OffsetArg,

        /// Erase block size in kB [4, 32, 64]
        #[arg(short = 'i', long, default_value_t = 64)]
        erase_size: u32,

        /// Erase the whole chip instead of only the blocks being written
        #[arg(long, conflicts_with = "no_erase")]
        bulk_erase: bool,

        /// Don't erase before writing
        #[arg(long)]
        no_erase: bool,

        /// Skip reading back after programming
        #[arg(long)]
        no_verify: bool,

        /// Read back each page right after programming it
        #[arg(long)]
        interleaved_verify: bool,

        /// Clear the flash status register protection bits first
        #[arg(long)]
        unprotect: bool,
    },

    /// Compare the flash against a file
    Verify {
        /// Input file, `-` for stdin
        file: PathBuf,

        #[command(flatten)]
        offset: OffsetArg,
    },

    /// Read flash contents to a file
    Read {
        /// Output file, `-` for stdout
        file: PathBuf,

        #[command(flatten)]
        offset: OffsetArg,

        /// Number of bytes to read
        #[arg(short = 'R', long, default_value = "256k", value_parser = parse_size)]
        size: u32,
    },

    /// Erase flash without writing
    Erase {
        /// Erase the blocks a write of this many bytes would touch
        #[arg(long, value_parser = parse_size, required_unless_present = "bulk", conflicts_with = "bulk")]
        size: Option<u32>,

        /// Erase the whole chip
        #[arg(long)]
        bulk: bool,

        /// Erase block size in kB [4, 32, 64]
        #[arg(short = 'i', long, default_value_t = 64)]
        erase_size: u32,

        #[command(flatten)]
        offset: OffsetArg,
    },

    /// Load a bitstream into configuration SRAM
    Sram {
        /// Bitstream file, `-` for stdin
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x20000"), Ok(0x20000));
        assert_eq!(parse_size("256k"), Ok(256 * 1024));
        assert_eq!(parse_size("1M"), Ok(1 << 20));
        assert_eq!(parse_size("0x10k"), Ok(16 * 1024));
        assert!(parse_size("8192M").is_err());
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn write_flags() {
        let cli = Cli::parse_from(["ecp-jtag", "--cable", "sim", "-k", "4", "write", "top.bit",
            "-o", "1M", "-i", "32", "--no-verify"]);
        assert_eq!(cli.cable, "sim");
        assert_eq!(cli.divider, Some(4));
        match cli.command {
            Commands::Write { offset, erase_size, no_verify, bulk_erase, .. } => {
                assert_eq!(offset.offset, 1 << 20);
                assert_eq!(erase_size, 32);
                assert!(no_verify);
                assert!(!bulk_erase);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["ecp-jtag", "write", "x", "--bulk-erase", "--no-erase"]).is_err());
        assert!(Cli::try_parse_from(["ecp-jtag", "-s", "-k", "2", "probe"]).is_err());
    }

    #[test]
    fn erase_needs_size_or_bulk() {
        assert!(Cli::try_parse_from(["ecp-jtag", "erase"]).is_err());
        assert!(Cli::try_parse_from(["ecp-jtag", "erase", "--bulk"]).is_ok());
        let cli = Cli::parse_from(["ecp-jtag", "erase", "--size", "100k"]);
        assert!(matches!(cli.command, Commands::Erase { size: Some(102400), .. }));
    }
}
