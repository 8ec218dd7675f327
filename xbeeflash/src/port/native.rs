//! `serialport` backend: USB adapters and bridged pseudo-terminals.
//!
//! A closed [`NativePort`] stays around as a value so the transport can keep
//! its name for logs; every I/O call on it fails with `NotConnected`.

use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use serialport::{ClearBuffer, SerialPort, SerialPortBuilder};

use crate::error::{Error, Result};
use crate::port::{DataBits, FlowControl, Parity, Port, PortOpener, SerialConfig, StopBits};

/// An open (or closed) `serialport` handle.
pub struct NativePort {
    handle: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

fn builder(config: &SerialConfig) -> SerialPortBuilder {
    let data_bits = match config.data_bits {
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    };
    let flow_control = match config.flow_control {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    };

    serialport::new(&config.port_name, config.baud_rate)
        .timeout(config.timeout)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
}

impl NativePort {
    /// Open `config.port_name` at `config.baud_rate`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let handle = builder(config).open()?;
        debug!("Opened {} at {} baud", config.port_name, config.baud_rate);

        Ok(Self {
            handle: Some(handle),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn handle(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.handle.as_mut().ok_or(Error::PortClosed)
    }

    fn io_handle(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.handle()?.set_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.handle()?.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("{}: DTR={level}", self.name);
        self.handle()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("{}: RTS={level}", self.name);
        self.handle()?.write_request_to_send(level)?;
        Ok(())
    }

    fn send_break(&mut self, duration: Duration) -> Result<()> {
        trace!("{}: break for {duration:?}", self.name);
        let handle = self.handle()?;
        handle.set_break()?;
        thread::sleep(duration);
        handle.clear_break()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle releases the device node, which is what lets a
        // bridge tear the virtual port down.
        if self.handle.take().is_some() {
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io_handle()?.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io_handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io_handle()?.flush()
    }
}

/// Opens [`NativePort`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    type Port = NativePort;

    fn is_present(&self, path: &str) -> bool {
        // Device nodes and socat-style symlinks show up on the filesystem;
        // Windows COM ports only show up in the enumeration.
        Path::new(path).exists()
            || serialport::available_ports()
                .map(|ports| ports.iter().any(|p| p.port_name == path))
                .unwrap_or(false)
    }

    fn open(&self, config: &SerialConfig) -> Result<NativePort> {
        NativePort::open(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default_is_8n1() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/tmp/ttyXBEE", 9600).with_timeout(Duration::from_secs(5));

        assert_eq!(config.port_name, "/tmp/ttyXBEE");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_path_is_not_present() {
        assert!(!NativeOpener.is_present("/nonexistent/ttyXBEE-missing"));
    }

    #[test]
    fn test_existing_path_is_present() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(NativeOpener.is_present(file.path().to_str().unwrap()));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/nonexistent/ttyXBEE-missing", 9600);
        assert!(NativeOpener.open(&config).is_err());
    }
}
