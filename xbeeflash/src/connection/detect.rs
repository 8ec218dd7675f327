//! Serial port discovery by USB VID/PID.
//!
//! XBee carrier boards put one of a handful of USB-UART bridges in front of
//! the radio:
//! - FTDI FT231X/FT232R (VID 0x0403), used on Digi development boards
//! - Silicon Labs CP210x (VID 0x10C4)
//! - WCH CH340/CH341 (VID 0x1A86)
//! - Prolific PL2303 (VID 0x067B)
//!
//! Bridged ports (`socat` PTYs, RFC 2217 redirectors) carry no USB
//! information and show up as [`UsbDevice::Unknown`].
//!
//! ```rust,no_run
//! use xbeeflash::connection::detect::detect_ports;
//!
//! for port in detect_ports() {
//!     println!("{} ({})", port.name, port.device.name());
//! }
//! ```

use log::{debug, info, trace};

/// Known USB-UART bridge families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UsbDevice {
    Ftdi,
    Cp210x,
    Ch340,
    Pl2303,
    Unknown,
}

impl UsbDevice {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, _pid: u16) -> Self {
        match vid {
            0x0403 => Self::Ftdi,
            0x10C4 => Self::Cp210x,
            0x1A86 => Self::Ch340,
            0x067B => Self::Pl2303,
            _ => Self::Unknown,
        }
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ftdi => "FTDI",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Pl2303 => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge chip was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    // Digi ships FTDI on its own boards, so prefer it when several match.
    fn priority(self) -> u8 {
        match self {
            Self::Ftdi => 0,
            Self::Cp210x => 1,
            Self::Ch340 => 2,
            Self::Pl2303 => 3,
            Self::Unknown => u8::MAX,
        }
    }
}

/// A serial port found on this host.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port path (e.g. `/dev/ttyUSB0`, `COM3`).
    pub name: String,
    /// Bridge chip family.
    pub device: UsbDevice,
    /// USB vendor ID.
    pub vid: Option<u16>,
    /// USB product ID.
    pub pid: Option<u16>,
    /// USB manufacturer string.
    pub manufacturer: Option<String>,
    /// USB product string.
    pub product: Option<String>,
    /// USB serial number.
    pub serial: Option<String>,
}

impl DetectedPort {
    fn plain(name: String) -> Self {
        Self {
            name,
            device: UsbDevice::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether the port sits behind a bridge an XBee board would use.
    pub fn is_likely_radio(&self) -> bool {
        self.device.is_known()
    }

    /// One-line summary for listings.
    pub fn describe(&self) -> String {
        let device_info = if self.device.is_known() {
            format!(" [{}]", self.device.name())
        } else if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = self
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        format!("{}{device_info}{product_info}", self.name)
    }
}

/// Enumerate serial ports with whatever USB information the OS provides.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let mut detected = DetectedPort::plain(info.port_name.clone());
                if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                    detected.device = UsbDevice::from_vid_pid(usb.vid, usb.pid);
                    detected.vid = Some(usb.vid);
                    detected.pid = Some(usb.pid);
                    detected.manufacturer = usb.manufacturer;
                    detected.product = usb.product;
                    detected.serial = usb.serial_number;
                    trace!(
                        "USB port {} (VID {:04X}, PID {:04X}, {:?})",
                        info.port_name, usb.vid, usb.pid, detected.device
                    );
                }
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Ports that look like a radio, best match first.
pub fn radio_candidates(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    let mut candidates: Vec<_> = ports.into_iter().filter(DetectedPort::is_likely_radio).collect();
    candidates.sort_by_key(|p| p.device.priority());
    candidates
}

/// Pick a port only when the choice is unambiguous.
///
/// Exactly one likely radio wins; otherwise a lone port of any kind is
/// used. Anything else returns `None` and the caller has to ask.
pub fn pick_unambiguous(ports: Vec<DetectedPort>) -> Option<DetectedPort> {
    let mut radios = radio_candidates(ports.clone());
    if radios.len() == 1 {
        let port = radios.remove(0);
        info!("Auto-detected {} bridge: {}", port.device.name(), port.name);
        return Some(port);
    }
    if radios.is_empty() && ports.len() == 1 {
        let port = ports.into_iter().next()?;
        info!("Using only available port: {}", port.name);
        return Some(port);
    }
    None
}

/// [`pick_unambiguous`] over the ports of this host.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Option<DetectedPort> {
    pick_unambiguous(detect_ports())
}
