//! Errors shared by the cable, JTAG and flash layers.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Any failure reported by the USB driver.  The TAP state can no longer be trusted.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("short write to adapter: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("timed out reading from adapter: {received} of {expected} bytes")]
    ReadTimeout { received: usize, expected: usize },
    #[error("adapter rejected MPSSE command {0:#04x}")]
    BadCommand(u8),
    #[error("no matching FTDI device found")]
    DeviceNotFound,
    #[error("invalid device string: {0}")]
    InvalidDeviceString(String),
    #[error("unknown cable type: {0}")]
    UnknownCable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("verify failed at address {address:#08x}")]
    VerifyMismatch { address: u32 },
    #[error("flash still busy after {polls} status polls")]
    BusyTimeout { polls: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this error: 1 for usage and file problems, 2 for hardware, 3 for a
    /// failed verify.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::VerifyMismatch { .. } => 3,
            Error::Io(_) | Error::InvalidArgument(_) | Error::UnknownCable(_)
                | Error::InvalidDeviceString(_) => 1,
            _ => 2,
        }
    }
}
