//! Transport ownership and device-path discovery.
//!
//! [`Transport`] owns at most one open port at a time. Ownership moves
//! linearly through probing, mode transitions and the upload, and a baud
//! change always means close, gate, reopen.

pub mod detect;
pub mod gate;

pub use detect::{DetectedPort, UsbDevice};
pub use gate::{DEFAULT_GATE_TIMEOUT, GateStatus, await_available};

use std::io::Read;
use std::time::Duration;

use log::{debug, info, trace};

use crate::clock::{Clock, SharedClock};
use crate::device::ResponseBuffer;
use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};

/// Pause after opening a port before it is written to.
pub const POST_OPEN_DELAY: Duration = Duration::from_secs(2);

/// Per-read timeout used while collecting responses.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Read from `port` until `window` elapses or `done` holds for what has
/// been received so far.
pub fn read_until<P, F>(port: &mut P, clock: &dyn Clock, window: Duration, done: F) -> Result<ResponseBuffer>
where
    P: Port + ?Sized,
    F: Fn(&ResponseBuffer) -> bool,
{
    let start = clock.now();
    let mut response = ResponseBuffer::new();
    let mut chunk = [0u8; 256];

    while clock.since(start) < window {
        match port.read(&mut chunk) {
            Ok(0) => clock.sleep(IDLE_POLL),
            Ok(n) => {
                trace!("RX {:02X?}", &chunk[..n]);
                response.push(&chunk[..n]);
                if done(&response) {
                    break;
                }
            },
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) => {},
            Err(e) => return Err(Error::Io(e)),
        }
    }

    Ok(response)
}

/// Read for `window`. With `stop_when_conclusive`, reading stops as soon as
/// a complete marker is in the buffer.
pub fn read_response<P>(
    port: &mut P,
    clock: &dyn Clock,
    window: Duration,
    stop_when_conclusive: bool,
) -> Result<ResponseBuffer>
where
    P: Port + ?Sized,
{
    read_until(port, clock, window, |r| stop_when_conclusive && r.is_conclusive())
}

/// The single owner of the open port for one device path.
pub struct Transport<O: PortOpener> {
    opener: O,
    path: String,
    clock: SharedClock,
    port: Option<O::Port>,
}

impl<O: PortOpener> Transport<O> {
    /// Create a closed transport for `path`.
    pub fn new(opener: O, path: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            opener,
            path: path.into(),
            clock,
            port: None,
        }
    }

    /// Device path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Clock used for every delay on this transport.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Shared handle to the clock, for code that also borrows the port.
    pub fn shared_clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Whether a port is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Baud rate of the open port.
    pub fn baud_rate(&self) -> Option<u32> {
        self.port.as_ref().map(Port::baud_rate)
    }

    /// The open port.
    pub fn port_mut(&mut self) -> Result<&mut O::Port> {
        self.port.as_mut().ok_or(Error::PortClosed)
    }

    /// Open at `baud`, closing any open port first.
    pub fn open(&mut self, baud: u32) -> Result<()> {
        self.close();

        let config = SerialConfig::new(self.path.clone(), baud).with_timeout(READ_TIMEOUT);
        let port = self.opener.open(&config)?;
        info!("Opened {} at {baud} baud", self.path);
        self.port = Some(port);

        self.clock.sleep(POST_OPEN_DELAY);
        Ok(())
    }

    /// Make sure the port is open at `baud`.
    ///
    /// A handle already at `baud` is reused. A handle at another rate goes
    /// through [`Transport::reopen`], so the path is gated again.
    pub fn ensure_open(&mut self, baud: u32, gate_timeout: Duration) -> Result<()> {
        match self.baud_rate() {
            Some(current) if current == baud => Ok(()),
            Some(_) => self.reopen(baud, gate_timeout),
            None => self.open(baud),
        }
    }

    /// Close the open port, if any.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                debug!("Error closing {}: {e}", self.path);
            }
            debug!("Closed {}", self.path);
        }
    }

    /// Wait for the device path, see [`gate::await_available`].
    pub fn await_available(&self, timeout: Duration) -> GateStatus {
        gate::await_available(&self.opener, &self.path, timeout, self.clock.as_ref())
    }

    /// Close, wait for the gate, then open at `baud`.
    pub fn reopen(&mut self, baud: u32, gate_timeout: Duration) -> Result<()> {
        self.close();
        match self.await_available(gate_timeout) {
            GateStatus::Available => self.open(baud),
            GateStatus::TimedOut => Err(Error::TransportUnavailable {
                path: self.path.clone(),
                timeout: gate_timeout,
            }),
        }
    }

    /// Write `bytes` and flush.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {bytes:02X?}");
        self.port_mut()?.write_all_bytes(bytes)
    }

    /// Drop any stale input.
    pub fn discard_input(&mut self) -> Result<()> {
        self.port_mut()?.clear_buffers()
    }

    /// Collect a response, see [`read_response`].
    pub fn collect(&mut self, window: Duration, stop_when_conclusive: bool) -> Result<ResponseBuffer> {
        let port = self.port.as_mut().ok_or(Error::PortClosed)?;
        read_response(port, self.clock.as_ref(), window, stop_when_conclusive)
    }

    /// Collect until `done` holds or `window` elapses, see [`read_until`].
    pub fn collect_until<F>(&mut self, window: Duration, done: F) -> Result<ResponseBuffer>
    where
        F: Fn(&ResponseBuffer) -> bool,
    {
        let port = self.port.as_mut().ok_or(Error::PortClosed)?;
        read_until(port, self.clock.as_ref(), window, done)
    }

    /// Give up ownership of the open port.
    pub fn into_port(mut self) -> Option<O::Port> {
        self.port.take()
    }
}
