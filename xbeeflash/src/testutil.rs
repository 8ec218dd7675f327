//! Simulated time, serial bus and radio for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};
use crate::protocol::commands::{
    BOOTLOADER_INVOKE, CANONICAL_BOOTLOADER_BAUD, DIRECT_INVOKE, EXIT_COMMAND_MODE, MENU_RUN,
    MENU_UPLOAD, MODE_ENTRY,
};
use crate::protocol::xmodem::{BLOCK_SIZE, CheckMode, control, crc16_xmodem};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Route `log` output through the test harness (`RUST_LOG=debug cargo test`).
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug)]
struct ClockState {
    base: Instant,
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Clock whose time only moves when someone sleeps.
#[derive(Debug, Clone)]
pub(crate) struct VirtualClock {
    state: Arc<Mutex<ClockState>>,
}

impl VirtualClock {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                base: Instant::now(),
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    pub(crate) fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    /// Virtual time since creation.
    pub(crate) fn elapsed(&self) -> Duration {
        lock(&self.state).offset
    }

    /// Every sleep requested so far, in order.
    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        let state = lock(&self.state);
        state.base + state.offset
    }

    fn sleep(&self, duration: Duration) {
        let mut state = lock(&self.state);
        state.offset += duration;
        state.sleeps.push(duration);
    }
}

/// Device reaction to one write: `(baud, bytes, when) -> reply`.
pub(crate) type Responder = Box<dyn FnMut(u32, &[u8], Instant) -> Vec<u8> + Send>;

/// One write seen on the bus.
#[derive(Debug, Clone)]
pub(crate) struct WriteRecord {
    pub at: Instant,
    pub baud: u32,
    pub bytes: Vec<u8>,
}

struct BusState {
    responder: Responder,
    rx: VecDeque<u8>,
    writes: Vec<WriteRecord>,
    opens: Vec<u32>,
    present: bool,
    presence_polls: usize,
    appear_after_polls: usize,
    signals: Vec<String>,
}

/// A simulated serial line with a device on the far end.
#[derive(Clone)]
pub(crate) struct SimBus {
    clock: VirtualClock,
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub(crate) fn new(clock: &VirtualClock, responder: Responder) -> Self {
        Self {
            clock: clock.clone(),
            state: Arc::new(Mutex::new(BusState {
                responder,
                rx: VecDeque::new(),
                writes: Vec::new(),
                opens: Vec::new(),
                present: true,
                presence_polls: 0,
                appear_after_polls: 0,
                signals: Vec::new(),
            })),
        }
    }

    /// A bus with a [`SimDevice`] attached. The device handle stays inspectable.
    pub(crate) fn with_device(
        clock: &VirtualClock,
        device: SimDevice,
    ) -> (Self, Arc<Mutex<SimDevice>>) {
        let device = Arc::new(Mutex::new(device));
        let handle = Arc::clone(&device);
        let bus = Self::new(
            clock,
            Box::new(move |baud, bytes, at| lock(&device).respond(baud, bytes, at)),
        );
        (bus, handle)
    }

    /// A bus whose far end never answers.
    pub(crate) fn silent(clock: &VirtualClock) -> Self {
        Self::new(clock, Box::new(|_, _, _| Vec::new()))
    }

    pub(crate) fn opener(&self) -> SimOpener {
        SimOpener { bus: self.clone() }
    }

    pub(crate) fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state).writes.clone()
    }

    /// Baud rate of every open, in order.
    pub(crate) fn opens(&self) -> Vec<u32> {
        lock(&self.state).opens.clone()
    }

    pub(crate) fn signals(&self) -> Vec<String> {
        lock(&self.state).signals.clone()
    }

    pub(crate) fn set_present(&self, present: bool) {
        lock(&self.state).present = present;
    }

    /// The path only appears once it has been polled `polls` times.
    pub(crate) fn appear_after_polls(&self, polls: usize) {
        let mut state = lock(&self.state);
        state.presence_polls = 0;
        state.appear_after_polls = polls;
    }

    pub(crate) fn presence_polls(&self) -> usize {
        lock(&self.state).presence_polls
    }
}

/// Opens [`SimPort`]s on a [`SimBus`].
pub(crate) struct SimOpener {
    bus: SimBus,
}

impl PortOpener for SimOpener {
    type Port = SimPort;

    fn is_present(&self, _path: &str) -> bool {
        let mut state = lock(&self.bus.state);
        state.presence_polls += 1;
        state.present && state.presence_polls > state.appear_after_polls
    }

    fn open(&self, config: &SerialConfig) -> Result<SimPort> {
        let mut state = lock(&self.bus.state);
        if !state.present {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such device",
            )));
        }
        state.opens.push(config.baud_rate);
        state.rx.clear();
        Ok(SimPort {
            bus: self.bus.clone(),
            name: config.port_name.clone(),
            baud: config.baud_rate,
            timeout: config.timeout,
            closed: false,
        })
    }
}

/// Port end of a [`SimBus`].
pub(crate) struct SimPort {
    bus: SimBus,
    name: String,
    baud: u32,
    timeout: Duration,
    closed: bool,
}

impl std::io::Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        {
            let mut state = lock(&self.bus.state);
            if !state.rx.is_empty() {
                let n = buf.len().min(state.rx.len());
                for b in buf.iter_mut().take(n) {
                    *b = state.rx.pop_front().unwrap_or_default();
                }
                return Ok(n);
            }
        }
        self.bus.clock.sleep(self.timeout);
        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"))
    }
}

impl std::io::Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        let at = self.bus.clock.now();
        let mut state = lock(&self.bus.state);
        state.writes.push(WriteRecord {
            at,
            baud: self.baud,
            bytes: buf.to_vec(),
        });
        let reply = (state.responder)(self.baud, buf, at);
        state.rx.extend(reply);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        lock(&self.bus.state).rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        lock(&self.bus.state).signals.push(format!("dtr={level}"));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        lock(&self.bus.state).signals.push(format!("rts={level}"));
        Ok(())
    }

    fn send_break(&mut self, duration: Duration) -> Result<()> {
        lock(&self.bus.state).signals.push("break".to_string());
        self.bus.clock.sleep(duration);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub(crate) const BOOTLOADER_MENU: &str =
    "\r\nGecko Bootloader v1.9.1\r\n1. upload gbl\r\n2. run\r\n3. ebl info\r\nBL > ";

/// What the simulated radio is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SimMode {
    /// Never answers anything.
    Silent,
    /// Running firmware in transparent mode.
    Firmware,
    /// Running firmware, in AT command mode.
    Command,
    /// Bootloader menu.
    Bootloader,
    /// Bootloader receiving an XMODEM image.
    Receiving,
}

/// A behavioural model of an XBee radio.
#[derive(Debug, Clone)]
pub(crate) struct SimDevice {
    pub mode: SimMode,
    pub firmware_baud: u32,
    /// Whether transparent firmware honours the direct bootloader probe.
    pub answers_direct_invoke: bool,
    /// Whether command mode honours the bootloader-invoke command.
    pub accepts_invoke: bool,
    /// Reboot into the bootloader without printing the menu at the old rate.
    pub quiet_reboot: bool,
    /// NAK this many XMODEM blocks before accepting them.
    pub nak_budget: usize,
    /// Reply to the guarded escape with this instead of `OK`.
    pub escape_reply: Option<Vec<u8>>,
    pub image: Vec<u8>,
    pub raw_bytes: Vec<u8>,
    pub blocks: u32,
    pub runs: u32,
    expected_seq: u8,
    last_write: Option<Instant>,
}

impl SimDevice {
    pub(crate) fn new(mode: SimMode, firmware_baud: u32) -> Self {
        Self {
            mode,
            firmware_baud,
            answers_direct_invoke: false,
            accepts_invoke: true,
            quiet_reboot: false,
            nak_budget: 0,
            escape_reply: None,
            image: Vec::new(),
            raw_bytes: Vec::new(),
            blocks: 0,
            runs: 0,
            expected_seq: 1,
            last_write: None,
        }
    }

    pub(crate) fn firmware(baud: u32) -> Self {
        Self::new(SimMode::Firmware, baud)
    }

    pub(crate) fn bootloader(firmware_baud: u32) -> Self {
        Self::new(SimMode::Bootloader, firmware_baud)
    }

    fn menu() -> Vec<u8> {
        BOOTLOADER_MENU.as_bytes().to_vec()
    }

    fn guard_satisfied(&self, at: Instant) -> bool {
        self.last_write
            .is_none_or(|last| at.saturating_duration_since(last) >= Duration::from_secs(1))
    }

    pub(crate) fn respond(&mut self, baud: u32, bytes: &[u8], at: Instant) -> Vec<u8> {
        let guard_ok = self.guard_satisfied(at);
        self.last_write = Some(at);

        match self.mode {
            SimMode::Silent => Vec::new(),
            SimMode::Firmware if baud == self.firmware_baud => {
                if bytes == MODE_ENTRY && guard_ok {
                    self.mode = SimMode::Command;
                    self.escape_reply
                        .clone()
                        .unwrap_or_else(|| b"OK\r".to_vec())
                } else if bytes == DIRECT_INVOKE && self.answers_direct_invoke {
                    self.mode = SimMode::Bootloader;
                    Self::menu()
                } else {
                    Vec::new()
                }
            },
            SimMode::Command if baud == self.firmware_baud => {
                if bytes == BOOTLOADER_INVOKE && self.accepts_invoke {
                    self.mode = SimMode::Bootloader;
                    if self.quiet_reboot { Vec::new() } else { Self::menu() }
                } else if bytes == EXIT_COMMAND_MODE {
                    self.mode = SimMode::Firmware;
                    b"OK\r".to_vec()
                } else if bytes == b"ATVR\r" {
                    b"1014\r".to_vec()
                } else if bytes == b"ATSH\r" {
                    b"13A200\r".to_vec()
                } else if bytes.starts_with(b"AT") {
                    b"0\r".to_vec()
                } else {
                    Vec::new()
                }
            },
            SimMode::Bootloader if baud == CANONICAL_BOOTLOADER_BAUD => {
                if bytes == b"\r" || bytes == b"\r\n" {
                    Self::menu()
                } else if bytes == [MENU_UPLOAD] {
                    self.mode = SimMode::Receiving;
                    self.expected_seq = 1;
                    b"\r\nbegin upload\r\nC".to_vec()
                } else if bytes == [MENU_RUN] {
                    self.mode = SimMode::Firmware;
                    self.runs += 1;
                    Vec::new()
                } else {
                    Vec::new()
                }
            },
            SimMode::Receiving if baud == CANONICAL_BOOTLOADER_BAUD => self.receive(bytes),
            _ => Vec::new(),
        }
    }

    fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes == [control::EOT] {
            self.mode = SimMode::Bootloader;
            let mut reply = vec![control::ACK];
            reply.extend_from_slice(b"\r\nSerial upload complete\r\n");
            return reply;
        }
        if bytes.first() == Some(&control::SOH) && bytes.len() == CheckMode::Crc16.frame_len() {
            if bytes[1] != self.expected_seq || bytes[2] != !self.expected_seq {
                return vec![control::NAK];
            }
            let payload = &bytes[3..3 + BLOCK_SIZE];
            let trailer = u16::from_be_bytes([bytes[3 + BLOCK_SIZE], bytes[4 + BLOCK_SIZE]]);
            if trailer != crc16_xmodem(payload) {
                return vec![control::NAK];
            }
            if self.nak_budget > 0 {
                self.nak_budget -= 1;
                return vec![control::NAK];
            }
            self.image.extend_from_slice(payload);
            self.expected_seq = self.expected_seq.wrapping_add(1);
            self.blocks += 1;
            return vec![control::ACK];
        }
        if bytes == [MENU_RUN] && !self.raw_bytes.is_empty() {
            // End of a raw upload: the image is reassembled and launched.
            self.mode = SimMode::Firmware;
            self.runs += 1;
            return Vec::new();
        }
        self.raw_bytes.extend_from_slice(bytes);
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::xmodem::build_block;

    fn receiving() -> SimDevice {
        let mut device = SimDevice::new(SimMode::Receiving, 9600);
        device.expected_seq = 1;
        device
    }

    #[test]
    fn test_receiver_naks_corrupted_crc() {
        let clock = VirtualClock::new();
        let mut device = receiving();
        let mut block = build_block(1, &[0x5A; 64], CheckMode::Crc16);
        let last = block.len() - 1;
        block[last] ^= 0xFF;

        let reply = device.respond(CANONICAL_BOOTLOADER_BAUD, &block, clock.now());

        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(device.blocks, 0);
        assert!(device.image.is_empty());
    }

    #[test]
    fn test_receiver_acks_valid_block() {
        let clock = VirtualClock::new();
        let mut device = receiving();
        let block = build_block(1, &[0x5A; 64], CheckMode::Crc16);

        let reply = device.respond(CANONICAL_BOOTLOADER_BAUD, &block, clock.now());

        assert_eq!(reply, vec![control::ACK]);
        assert_eq!(device.blocks, 1);
        assert_eq!(device.image.len(), BLOCK_SIZE);
    }
}
