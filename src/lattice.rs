//! Lattice ECP5 and Nexus parts: IDCODE table, configuration instructions, and status register
//! decoding.
use std::fmt;

/// JTAG instructions used for configuration.  All are 8-bit IR values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Instruction {
    ReadId = 0xE0,
    LscReadStatus = 0x3C,
    IscEnable = 0xC6,
    IscErase = 0x0E,
    IscDisable = 0x26,
    LscBitstreamBurst = 0x7A,
    LscResetCrc = 0x3B,
    LscRefresh = 0x79,
    LscBackgroundSpi = 0x3A,
}

impl Instruction {
    pub fn ir_bits(self) -> usize {
        8
    }

    /// Width of the DR payload that goes with this instruction.  `None` for the bitstream burst,
    /// which streams however many bits the bitstream has.
    pub fn payload_bits(self, family: Family) -> Option<usize> {
        match self {
            Instruction::ReadId => Some(32),
            Instruction::LscReadStatus => Some(family.status_bits()),
            Instruction::IscEnable | Instruction::IscErase | Instruction::LscResetCrc => Some(8),
            Instruction::IscDisable | Instruction::LscRefresh => Some(0),
            Instruction::LscBackgroundSpi => Some(16),
            Instruction::LscBitstreamBurst => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Family {
    Ecp5,
    Nx,
    Unknown,
}

impl Family {
    pub fn status_bits(self) -> usize {
        match self {
            Family::Nx => 64,
            Family::Ecp5 | Family::Unknown => 32,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Ecp5 => "ECP5",
            Family::Nx => "NX",
            Family::Unknown => "unknown",
        })
    }
}

const ECP5_DEVICES: &[(&str, u32)] = &[
    ("LFE5U-12", 0x21111043),
    ("LFE5U-25", 0x41111043),
    ("LFE5U-45", 0x41112043),
    ("LFE5U-85", 0x41113043),
    ("LFE5UM-25", 0x01111043),
    ("LFE5UM-45", 0x01112043),
    ("LFE5UM-85", 0x01113043),
    ("LFE5UM5G-25", 0x81111043),
    ("LFE5UM5G-45", 0x81112043),
    ("LFE5UM5G-85", 0x81113043),
];

const NX_DEVICES: &[(&str, u32)] = &[
    ("LIFCL-17", 0x010F0043),
    ("LIFCL-40-ES", 0x010F1043),
    ("LIFCL-40", 0x110F1043),
    ("LFD2NX-17", 0x310F0043),
    ("LFD2NX-40", 0x310F1043),
    ("LFCPNX-100", 0x010F4043),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub idcode: u32,
    pub name: Option<&'static str>,
    pub family: Family,
}

impl DeviceIdentity {
    /// Resolve an IDCODE against the known parts.  Unknown parts are not an error.
    pub fn lookup(idcode: u32) -> Self {
        let find = |table: &[(&'static str, u32)]| {
            table.iter().find(|(_, id)| *id == idcode).map(|(name, _)| *name)
        };
        if let Some(name) = find(ECP5_DEVICES) {
            Self { idcode, name: Some(name), family: Family::Ecp5 }
        } else if let Some(name) = find(NX_DEVICES) {
            Self { idcode, name: Some(name), family: Family::Nx }
        } else {
            Self { idcode, name: None, family: Family::Unknown }
        }
    }

    pub fn is_known(&self) -> bool {
        self.family != Family::Unknown
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => write!(f, "IDCODE: 0x{:08x} ({})", self.idcode, name),
            None => write!(f, "IDCODE: 0x{:08x} does not match any known device", self.idcode),
        }
    }
}

/// Bitstream engine error codes.  The NX adds codes 8 to 10.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BseError {
    NoError,
    Id,
    IllegalCommand,
    Crc,
    Preamble,
    Aborted,
    Overflow,
    SramOverflow,
    Authentication,
    AuthenticationSetup,
    Timeout,
    Reserved(u8),
}

impl From<u8> for BseError {
    fn from(code: u8) -> Self {
        match code {
            0 => BseError::NoError,
            1 => BseError::Id,
            2 => BseError::IllegalCommand,
            3 => BseError::Crc,
            4 => BseError::Preamble,
            5 => BseError::Aborted,
            6 => BseError::Overflow,
            7 => BseError::SramOverflow,
            8 => BseError::Authentication,
            9 => BseError::AuthenticationSetup,
            10 => BseError::Timeout,
            n => BseError::Reserved(n),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigTarget {
    Sram,
    Efuse,
    EfuseNormal,
    EfusePseudo,
    EfuseSafe,
    Invalid(u8),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Ecdsa,
    Hmac,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ecp5Status(pub u32);

impl Ecp5Status {
    fn bit(&self, n: u32) -> bool {
        ((self.0 >> n) & 1) == 1
    }

    pub fn transparent(&self) -> bool { self.bit(0) }

    pub fn config_target(&self) -> ConfigTarget {
        match (self.0 >> 1) & 0b111 {
            0 => ConfigTarget::Sram,
            _ => ConfigTarget::Efuse,
        }
    }

    pub fn done(&self) -> bool { self.bit(8) }
    pub fn isc_enable(&self) -> bool { self.bit(9) }
    pub fn busy(&self) -> bool { self.bit(12) }
    pub fn fail(&self) -> bool { self.bit(13) }

    pub fn bse_error(&self) -> BseError {
        BseError::from(((self.0 >> 23) & 0b111) as u8)
    }

    fn flags(&self) -> Vec<(&'static str, bool)> {
        const BITS: &[(&str, u32)] = &[
            ("Transparent Mode", 0), ("JTAG Active", 4), ("PWD Protection", 5),
            ("Decrypt Enable", 7), ("DONE", 8), ("ISC Enable", 9), ("Write Enable", 10),
            ("Read Enable", 11), ("Busy Flag", 12), ("Fail Flag", 13), ("Feature OTP", 14),
            ("Decrypt Only", 15), ("PWD Enable", 16), ("Encrypt Preamble", 20),
            ("Std Preamble", 21), ("SPIm Fail 1", 22), ("Execution Error", 26), ("ID Error", 27),
            ("Invalid Command", 28), ("SED Error", 29), ("Bypass Mode", 30),
            ("Flow Through Mode", 31),
        ];
        BITS.iter().map(|&(name, n)| (name, self.bit(n))).collect()
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NxStatus(pub u64);

impl NxStatus {
    fn bit(&self, n: u32) -> bool {
        ((self.0 >> n) & 1) == 1
    }

    pub fn config_target(&self) -> ConfigTarget {
        match ((self.0 >> 1) & 0b111) as u8 {
            0 => ConfigTarget::Sram,
            1 => ConfigTarget::EfuseNormal,
            2 => ConfigTarget::EfusePseudo,
            3 => ConfigTarget::EfuseSafe,
            n => ConfigTarget::Invalid(n),
        }
    }

    pub fn done(&self) -> bool { self.bit(8) }
    pub fn isc_enable(&self) -> bool { self.bit(9) }
    pub fn busy(&self) -> bool { self.bit(12) }
    pub fn fail(&self) -> bool { self.bit(13) }

    pub fn bse_error(&self) -> BseError {
        BseError::from(((self.0 >> 24) & 0b1111) as u8)
    }

    /// Error code left by the previously loaded bitstream.
    pub fn previous_bse_error(&self) -> BseError {
        BseError::from(((self.0 >> 34) & 0b1111) as u8)
    }

    pub fn auth_mode(&self) -> AuthMode {
        match (self.0 >> 48) & 0b11 {
            0b01 => AuthMode::Ecdsa,
            0b10 => AuthMode::Hmac,
            _ => AuthMode::None,
        }
    }

    fn flags(&self) -> Vec<(&'static str, bool)> {
        const BITS: &[(&str, u32)] = &[
            ("Transparent Mode", 0), ("JTAG Active", 4), ("PWD Protection", 5), ("OTP", 6),
            ("DONE", 8), ("ISC Enable", 9), ("Write Enable", 10), ("Read Enable", 11),
            ("Busy Flag", 12), ("Fail Flag", 13), ("Decrypt Only", 15), ("PWD Enable", 16),
            ("PWD All", 17), ("CID EN", 18), ("Encrypt Preamble", 21), ("Std Preamble", 22),
            ("SPIm Fail 1", 23), ("Execution Error", 28), ("ID Error", 29),
            ("Invalid Command", 30), ("WDT Busy", 31), ("Dry Run DONE", 33), ("Bypass Mode", 38),
            ("Flow Through Mode", 39), ("SFDP Timeout", 42), ("Key Destroy Pass", 43),
            ("INITN", 44), ("I3C Parity Error 2", 45), ("Init Bus ID Error", 46),
            ("I3C Parity Error 1", 47), ("Authentication Done", 50),
            ("Dry Run Authentication Done", 51), ("JTAG Locked", 52), ("SSPI Locked", 53),
            ("I2C/I3C Locked", 54), ("PUB Read Lock", 55), ("PUB Write Lock", 56),
            ("FEA Read Lock", 57), ("FEA Write Lock", 58), ("AES Read Lock", 59),
            ("AES Write Lock", 60), ("PWD Read Lock", 61), ("PWD Write Lock", 62),
            ("Global Lock", 63),
        ];
        BITS.iter().map(|&(name, n)| (name, self.bit(n))).collect()
    }
}

/// A status register read back from the device, decoded according to its family.
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum DecodedStatus {
    Ecp5(Ecp5Status),
    Nx(NxStatus),
}

impl DecodedStatus {
    /// Build from the raw DR bytes, least significant byte first.
    pub fn from_bytes(family: Family, data: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        let n = data.len().min(8);
        raw[..n].copy_from_slice(&data[..n]);
        match family {
            Family::Nx => DecodedStatus::Nx(NxStatus(u64::from_le_bytes(raw))),
            Family::Ecp5 | Family::Unknown => {
                let word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                DecodedStatus::Ecp5(Ecp5Status(word))
            }
        }
    }

    pub fn raw(&self) -> u64 {
        match self {
            DecodedStatus::Ecp5(s) => s.0 as u64,
            DecodedStatus::Nx(s) => s.0,
        }
    }

    pub fn done(&self) -> bool {
        match self {
            DecodedStatus::Ecp5(s) => s.done(),
            DecodedStatus::Nx(s) => s.done(),
        }
    }

    pub fn busy(&self) -> bool {
        match self {
            DecodedStatus::Ecp5(s) => s.busy(),
            DecodedStatus::Nx(s) => s.busy(),
        }
    }

    pub fn fail(&self) -> bool {
        match self {
            DecodedStatus::Ecp5(s) => s.fail(),
            DecodedStatus::Nx(s) => s.fail(),
        }
    }

    pub fn bse_error(&self) -> BseError {
        match self {
            DecodedStatus::Ecp5(s) => s.bse_error(),
            DecodedStatus::Nx(s) => s.bse_error(),
        }
    }
}

fn yes_no(b: bool) -> &'static str {
    if b { "Yes" } else { "No" }
}

/// `{}` prints the one-line summary, `{:#}` adds every field.
impl fmt::Display for DecodedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedStatus::Ecp5(s) => {
                write!(f, "ECP5 Status Register: 0x{:08x}", s.0)?;
                if f.alternate() {
                    write!(f, "\n  {:<28}{:?}", "Config Target:", s.config_target())?;
                    for (name, value) in s.flags() {
                        write!(f, "\n  {:<28}{}", format!("{name}:"), yes_no(value))?;
                    }
                    write!(f, "\n  {:<28}{:?}", "BSE Error Code:", s.bse_error())?;
                }
            }
            DecodedStatus::Nx(s) => {
                write!(f, "NX Status Register: 0x{:016x}", s.0)?;
                if f.alternate() {
                    write!(f, "\n  {:<28}{:?}", "Config Target:", s.config_target())?;
                    for (name, value) in s.flags() {
                        write!(f, "\n  {:<28}{}", format!("{name}:"), yes_no(value))?;
                    }
                    write!(f, "\n  {:<28}{:?}", "BSE Error Code:", s.bse_error())?;
                    write!(f, "\n  {:<28}{:?}", "BSE Error 1 Code:", s.previous_bse_error())?;
                    write!(f, "\n  {:<28}{:?}", "Authentication Mode:", s.auth_mode())?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DecodedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self)
    }
}
