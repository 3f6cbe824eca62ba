//! Implementations for the hardware adapters live here.  An adapter only has to move MPSSE
//! command bytes to the FTDI engine and hand back whatever it answers; everything above that is
//! built on the `Cable` trait.
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(feature = "ftd2xx")]
pub mod ftd2xx;
pub mod sim;

/// Empty reads tolerated by `Cable::read_exact` before giving up.
pub const READ_RETRIES: u32 = 10_000;
const READ_RETRY_DELAY: Duration = Duration::from_micros(100);

pub trait Cable {
    /// Send a block of MPSSE commands.  A write that does not take every byte is an error.
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;
    /// Read whatever response bytes are available, up to `buf.len()`.  Returns the number of
    /// bytes read, which may be zero.
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fill `buf` completely, accumulating short reads.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut received = 0;
        let mut retries = 0;
        while received < buf.len() {
            let n = self.read_bytes(&mut buf[received..])?;
            if n == 0 {
                retries += 1;
                if retries > READ_RETRIES {
                    return Err(Error::ReadTimeout { received, expected: buf.len() });
                }
                thread::sleep(READ_RETRY_DELAY);
            } else {
                received += n;
                retries = 0;
            }
        }
        Ok(())
    }
}

const SYNC_OPCODE: u8 = 0xAB;
const SEND_IMMEDIATE: u8 = 0x87;

/// Make sure the MPSSE engine is in step with us.  An invalid opcode must come back as `0xFA`
/// followed by the opcode itself; anything else means stale bytes are in the receive FIFO or an
/// earlier command was rejected.
pub fn check_sync<C: Cable + ?Sized>(cable: &mut C) -> Result<()> {
    cable.write_bytes(&[SYNC_OPCODE, SEND_IMMEDIATE])?;
    let mut resp = [0u8; 2];
    cable.read_exact(&mut resp)?;
    match resp {
        [0xFA, SYNC_OPCODE] => Ok(()),
        [0xFA, op] => Err(Error::BadCommand(op)),
        _ => Err(Error::Transport(format!(
            "MPSSE engine out of sync, got {:02X} {:02X}", resp[0], resp[1]))),
    }
}

/// Channel of a multi-interface FTDI part.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interface {
    #[default]
    A,
    B,
    C,
    D,
}

impl Interface {
    pub fn letter(self) -> char {
        match self {
            Interface::A => 'A',
            Interface::B => 'B',
            Interface::C => 'C',
            Interface::D => 'D',
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Interface {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "A" | "a" => Ok(Interface::A),
            "B" | "b" => Ok(Interface::B),
            "C" | "c" => Ok(Interface::C),
            "D" | "d" => Ok(Interface::D),
            _ => Err(Error::InvalidArgument(format!("invalid interface: {s}"))),
        }
    }
}

/// How to find and clock the adapter.
#[derive(Clone, Debug)]
pub struct CableConfig {
    pub interface: Interface,
    /// `s:VID:PID:SERIAL` or `i:VID:PID[:INDEX]`; `None` opens the first adapter by description.
    pub device: Option<String>,
    /// TCK runs at 6 MHz divided by this value.
    pub clock_divider: u32,
}

impl Default for CableConfig {
    fn default() -> Self {
        Self {
            interface: Interface::A,
            device: None,
            clock_divider: 1,
        }
    }
}

impl CableConfig {
    pub const MAX_DIVIDER: u32 = 65536;

    pub fn validate(&self) -> Result<()> {
        if self.clock_divider == 0 || self.clock_divider > Self::MAX_DIVIDER {
            return Err(Error::InvalidArgument(format!(
                "clock divider must be in range 1-{}", Self::MAX_DIVIDER)));
        }
        Ok(())
    }
}

/// Open a cable by name.  "ftdi" is an FT2232H/FT4232H/FT232H through D2XX, "sim" is the
/// in-process simulated board.
pub fn new_from_string(name: &str, config: &CableConfig) -> Result<Box<dyn Cable>> {
    config.validate()?;
    match name {
        #[cfg(feature = "ftd2xx")]
        "ftdi" => Ok(Box::new(ftd2xx::Ft2232::open(config)?)),
        "sim" => Ok(Box::new(sim::SimCable::new(sim::SimConfig::default()))),
        _ => Err(Error::UnknownCable(name.to_string())),
    }
}
