//! Implement the `Cable` trait for FT2232H/FT4232H/FT232H adapters through the FTDI D2XX driver.
//! The JTAG pins are the usual MPSSE ones on the low byte of the selected interface.
use std::time::Duration;

use ftdi_mpsse::MpsseCmdBuilder;
use libftd2xx::{BitMode, Ftdi, FtdiCommon, FtStatus};
use log::{debug, info, warn};

use crate::cable::{check_sync, Cable, CableConfig, Interface};
use crate::error::{Error, Result};

// Lower pins
const PIN_TCK: u8 = 1;
const PIN_TDI: u8 = 1 << 1;
//const PIN_TDO: u8 = 1 << 2;
const PIN_TMS: u8 = 1 << 3;
const LOWER_OUTPUT_PINS: u8 = PIN_TCK | PIN_TDI | PIN_TMS;

const LATENCY: Duration = Duration::from_millis(1);
const USB_TIMEOUT: Duration = Duration::from_secs(1);

fn ft_status_to_err(e: FtStatus) -> Error {
    Error::Transport(format!("FTDI D2XX error: {e}"))
}

/// How to find the adapter, parsed from a device string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    /// First adapter whose description matches the interface.
    Default,
    /// `s:VID:PID:SERIAL`
    Serial { vid: u16, pid: u16, serial: String },
    /// `i:VID:PID[:INDEX]`
    Index { vid: u16, pid: u16, index: usize },
}

fn parse_id(s: &str, what: &str) -> Result<u16> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidDeviceString(format!("bad {what} `{s}`")))
}

impl DeviceSelector {
    pub fn parse(device: Option<&str>) -> Result<Self> {
        let Some(device) = device else {
            return Ok(DeviceSelector::Default);
        };
        let fields: Vec<&str> = device.split(':').collect();
        match fields.as_slice() {
            ["s", vid, pid, serial] => Ok(DeviceSelector::Serial {
                vid: parse_id(vid, "vendor id")?,
                pid: parse_id(pid, "product id")?,
                serial: serial.to_string(),
            }),
            ["i", vid, pid] => Ok(DeviceSelector::Index {
                vid: parse_id(vid, "vendor id")?,
                pid: parse_id(pid, "product id")?,
                index: 0,
            }),
            ["i", vid, pid, index] => Ok(DeviceSelector::Index {
                vid: parse_id(vid, "vendor id")?,
                pid: parse_id(pid, "product id")?,
                index: index.parse().map_err(|_| {
                    Error::InvalidDeviceString(format!("bad index `{index}`"))
                })?,
            }),
            ["d", ..] => Err(Error::InvalidDeviceString(
                "bus/device paths are not supported by the D2XX driver".to_string())),
            _ => Err(Error::InvalidDeviceString(device.to_string())),
        }
    }
}

fn open_default(interface: Interface) -> Result<Ftdi> {
    let letter = interface.letter();
    let mut candidates = vec![
        format!("Dual RS232-HS {letter}"),
        format!("Quad RS232-HS {letter}"),
    ];
    if interface == Interface::A {
        candidates.push("Single RS232-HS".to_string());
    }
    for description in &candidates {
        match Ftdi::with_description(description) {
            Ok(ft) => {
                debug!("opened \"{}\"", description);
                return Ok(ft);
            }
            Err(e) => debug!("\"{}\": {}", description, e),
        }
    }
    Err(Error::DeviceNotFound)
}

fn open_serial(serial: &str, interface: Interface) -> Result<Ftdi> {
    // Multi-interface parts append the interface letter to the serial number.
    let with_letter = format!("{serial}{}", interface.letter());
    Ftdi::with_serial_number(&with_letter)
        .or_else(|_| Ftdi::with_serial_number(serial))
        .map_err(|_| Error::DeviceNotFound)
}

/// Interface letter at the end of a D2XX description such as "Dual RS232-HS B".
fn interface_suffix(description: &str) -> Option<char> {
    let mut chars = description.chars().rev();
    match (chars.next(), chars.next()) {
        (Some(c @ 'A'..='D'), Some(' ')) => Some(c),
        _ => None,
    }
}

fn open_index(vid: u16, pid: u16, index: usize, interface: Interface) -> Result<Ftdi> {
    let devices = libftd2xx::list_devices().map_err(ft_status_to_err)?;
    let info = devices.into_iter()
        .filter(|d| d.vendor_id == vid && d.product_id == pid)
        .filter(|d| match interface_suffix(&d.description) {
            Some(c) => c == interface.letter(),
            None => interface == Interface::A,
        })
        .nth(index)
        .ok_or(Error::DeviceNotFound)?;
    Ftdi::with_serial_number(&info.serial_number).map_err(ft_status_to_err)
}

pub struct Ft2232 {
    ft: Ftdi,
    saved_latency: Option<Duration>,
}

impl Ft2232 {
    /// Open the adapter, put it in MPSSE mode, and set TCK to 6 MHz / `clock_divider`.
    pub fn open(config: &CableConfig) -> Result<Self> {
        config.validate()?;
        let selector = DeviceSelector::parse(config.device.as_deref())?;
        let ft = match &selector {
            DeviceSelector::Default => open_default(config.interface)?,
            DeviceSelector::Serial { serial, .. } => open_serial(serial, config.interface)?,
            DeviceSelector::Index { vid, pid, index } =>
                open_index(*vid, *pid, *index, config.interface)?,
        };

        let mut cable = Ft2232 { ft, saved_latency: None };
        cable.ft.reset().map_err(ft_status_to_err)?;
        cable.ft.purge_all().map_err(ft_status_to_err)?;
        cable.saved_latency = Some(cable.ft.latency_timer().map_err(ft_status_to_err)?);
        cable.ft.set_latency_timer(LATENCY).map_err(ft_status_to_err)?;
        cable.ft.set_timeouts(USB_TIMEOUT, USB_TIMEOUT).map_err(ft_status_to_err)?;
        cable.ft.set_bit_mode(0xFF, BitMode::Mpsse).map_err(ft_status_to_err)?;
        cable.ft.purge_all().map_err(ft_status_to_err)?;

        let builder = MpsseCmdBuilder::new()
            .set_clock(config.clock_divider - 1, Some(true))
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking()
            .disable_loopback()
            .set_gpio_lower(PIN_TMS, LOWER_OUTPUT_PINS);
        cable.write_bytes(builder.as_slice())?;
        check_sync(&mut cable)?;
        info!("cable ready, TCK {} kHz", 6000 / config.clock_divider.max(1));

        Ok(cable)
    }
}

impl Cable for Ft2232 {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let written = self.ft.write(data).map_err(ft_status_to_err)?;
        if written != data.len() {
            return Err(Error::ShortWrite { written, expected: data.len() });
        }
        Ok(())
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ft.read(buf).map_err(ft_status_to_err)
    }
}

impl Drop for Ft2232 {
    fn drop(&mut self) {
        if let Some(latency) = self.saved_latency {
            if let Err(e) = self.ft.set_latency_timer(latency) {
                warn!("failed to restore latency timer: {}", e);
            }
        }
        if let Err(e) = self.ft.set_bit_mode(0, BitMode::Reset) {
            warn!("failed to leave MPSSE mode: {}", e);
        }
        let _ = self.ft.close();
    }
}
