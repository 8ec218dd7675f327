//! Port abstraction for serial communication.
//!
//! The recovery and transfer logic never touches a concrete serial API. It
//! talks to a [`Port`], and it obtains ports through a [`PortOpener`], which
//! also answers whether the device path currently exists. That split lets the
//! same code drive a USB-serial adapter, a network-bridged virtual device, or
//! a simulated device in tests.
//!
//! ```text
//! +--------------------------------------+
//! | recovery / probe / mode / flash      |
//! +------------------+-------------------+
//!                    |
//!          +---------v----------+
//!          | Transport (owner)  |
//!          +---------+----------+
//!                    |
//!      +-------------v--------------+
//!      | PortOpener -> Port trait   |
//!      +-------------+--------------+
//!                    |
//!          +---------v----------+
//!          | NativePort         |
//!          |   (serialport)     |
//!          +--------------------+
//! ```
//!
//! There is no live baud-rate setter. Bridged virtual ports cannot be
//! reconfigured in place, so changing baud means closing the port and opening
//! a new one.

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "/tmp/ttyXBEE", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Unified port trait for serial communication.
///
/// Every read is bounded by [`Port::timeout`]; implementations must return
/// [`std::io::ErrorKind::TimedOut`] instead of blocking indefinitely.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Baud rate the port was opened at.
    fn baud_rate(&self) -> u32;

    /// Discard any buffered input and pending output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Hold the line in break state for `duration`.
    fn send_break(&mut self, duration: Duration) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens ports and reports whether a device path is currently present.
///
/// Bridged virtual devices disappear while the bridge reconnects, so presence
/// is a question asked repeatedly, not once.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Whether `path` currently exists and can be opened.
    fn is_present(&self, path: &str) -> bool;

    /// Open a port with the given configuration.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;
}

#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort};
