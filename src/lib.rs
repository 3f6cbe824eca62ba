//! This crate programs Lattice ECP5 and Nexus FPGAs, and the SPI flash they boot from, through
//! an FTDI MPSSE JTAG adapter.  It is layered the same way from the bottom up.
//!
//! At the lowest level is the Cable trait, which only moves MPSSE command bytes to the adapter
//! and reads back what it answers.  There is an FT2232H/FT4232H/FT232H cable using the D2XX
//! driver, and a simulated cable with a model of the FPGA and its flash behind it.
//!
//! The next level is the JtagSM, which keeps track of the TAP state.  You tell it which state you
//! want (e.g., Reset or Idle) and it gets there with the fewest TMS transitions.  It can shift
//! bits through the instruction and data registers, either reading TDO or write-only, and
//! optionally leave the shift state on the last bit.
//!
//! On top of that, the spi module tunnels SPI transactions through the FPGA's background SPI
//! port: entering Shift-DR asserts chip select on the flash and leaving it releases it.  The
//! flash module drives a SPI NOR part over that bridge, and the Programmer ties everything
//! together into identify, erase, program, verify, read and SRAM load operations.
//!
//! # Example
//! ```
//! use ecp_jtag::cable::sim::{NoDelay, SimCable, SimConfig};
//! use ecp_jtag::flash::FlashConfig;
//! use ecp_jtag::programmer::Programmer;
//!
//! let cable = Box::new(SimCable::new(SimConfig::default()));
//! let mut prog = Programmer::new(cable, NoDelay, FlashConfig::default())?;
//! let device = prog.identify()?;
//! assert_eq!(device.name, Some("LFE5U-25"));
//!
//! let image = vec![0x55; 1024];
//! prog.erase(0..image.len() as u32)?;
//! prog.program(0, &image)?;
//! prog.verify(0, &image)?;
//! # Ok::<(), ecp_jtag::Error>(())
//! ```

pub mod cable;
pub mod error;
pub mod flash;
pub mod lattice;
pub mod programmer;
pub mod shift;
pub mod spi;
pub mod statemachine;

pub use error::{Error, Result};
