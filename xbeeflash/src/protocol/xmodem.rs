//! XMODEM file transfer protocol (sender side).
//!
//! The Gecko bootloader receives application images over XMODEM with
//! 128-byte blocks. The receiver chooses the integrity check with the byte it
//! sends to start the transfer: `C` asks for CRC-16, `NAK` for the classic
//! 8-bit checksum.
//!
//! ```text
//! Block format:
//! +-----+-----+------+--------------+-----------------+
//! | SOH | SEQ | ~SEQ |  DATA (128)  | CRC16 / CHKSUM  |
//! +-----+-----+------+--------------+-----------------+
//! |  1  |  1  |  1   |     128      |     2 / 1       |
//! +-----+-----+------+--------------+-----------------+
//! ```

use crate::clock::Clock;
use crate::error::{Error, Result, TransferFailure};
use crc::{CRC_16_XMODEM, Crc};
use log::{debug, trace};
use std::io::{Read, Write};
use std::time::Duration;

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
}

/// Payload bytes per block.
pub const BLOCK_SIZE: usize = 128;

/// Byte used to pad the final block.
pub const PAD_BYTE: u8 = 0x00;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM over `data`.
#[must_use]
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// 8-bit additive checksum over `data`.
#[must_use]
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Integrity check requested by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// Two-byte CRC-16/XMODEM, big-endian.
    Crc16,
    /// One-byte additive checksum.
    Checksum,
}

impl CheckMode {
    /// Total frame length for this mode.
    #[must_use]
    pub fn frame_len(self) -> usize {
        match self {
            Self::Crc16 => 3 + BLOCK_SIZE + 2,
            Self::Checksum => 3 + BLOCK_SIZE + 1,
        }
    }
}

/// Pause between reads of a non-blocking port.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// XMODEM configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Timeout for a single reply byte on a non-blocking port.
    pub char_timeout: Duration,
    /// Timeout for the receiver's start request.
    pub start_timeout: Duration,
    /// Maximum sends of one block (and of EOT).
    pub max_retries: u32,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            char_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_secs(60),
            max_retries: 10,
        }
    }
}

/// Build one framed block. `data` shorter than a block is padded.
#[must_use]
pub fn build_block(seq: u8, data: &[u8], mode: CheckMode) -> Vec<u8> {
    let mut block = Vec::with_capacity(mode.frame_len());

    // Header
    block.push(control::SOH);
    block.push(seq);
    block.push(!seq);

    // Data (padded if necessary)
    let take = data.len().min(BLOCK_SIZE);
    block.extend_from_slice(&data[..take]);
    block.resize(3 + BLOCK_SIZE, PAD_BYTE);

    let payload = &block[3..3 + BLOCK_SIZE];
    match mode {
        CheckMode::Crc16 => {
            let crc = crc16_xmodem(payload);
            block.extend_from_slice(&crc.to_be_bytes());
        },
        CheckMode::Checksum => {
            let sum = checksum8(payload);
            block.push(sum);
        },
    }

    block
}

/// Number of blocks needed for `len` bytes.
#[must_use]
pub fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}

/// XMODEM sender.
pub struct XmodemSender<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    clock: &'a dyn Clock,
    config: XmodemConfig,
}

impl<'a, P: Read + Write + ?Sized> XmodemSender<'a, P> {
    /// Create a sender with default configuration.
    pub fn new(port: &'a mut P, clock: &'a dyn Clock) -> Self {
        Self::with_config(port, clock, XmodemConfig::default())
    }

    /// Create a sender with custom configuration.
    pub fn with_config(port: &'a mut P, clock: &'a dyn Clock, config: XmodemConfig) -> Self {
        Self {
            port,
            clock,
            config,
        }
    }

    /// Read a single byte. `None` means no reply arrived in time.
    ///
    /// A blocking port bounds the read with its own timeout. A port that
    /// reports `WouldBlock` is polled until `char_timeout` runs out.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let start = self.clock.now();
        loop {
            match self.port.read(&mut buf) {
                Ok(1) => return Ok(Some(buf[0])),
                Ok(_) => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if self.clock.since(start) >= self.config.char_timeout {
                        return Ok(None);
                    }
                    self.clock.sleep(POLL_INTERVAL);
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Wait for the receiver to request the transfer and report the check mode.
    pub fn wait_for_start(&mut self) -> Result<CheckMode> {
        debug!("Waiting for receiver start request...");
        let start = self.clock.now();

        while self.clock.since(start) < self.config.start_timeout {
            match self.read_byte()? {
                Some(control::C) => {
                    debug!("Receiver requested CRC-16 mode");
                    return Ok(CheckMode::Crc16);
                },
                Some(control::NAK) => {
                    debug!("Receiver requested checksum mode");
                    return Ok(CheckMode::Checksum);
                },
                Some(control::CAN) => {
                    return Err(TransferFailure::ReceiverCancelled { block: 0 }.into());
                },
                Some(c) => trace!("Ignoring pre-transfer byte 0x{c:02X}"),
                None => {},
            }
        }

        Err(TransferFailure::NoReceiver.into())
    }

    /// Send a block until ACKed, bounded by `max_retries`.
    fn send_block(&mut self, block: &[u8], index: u32) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            trace!("Sending block {index} (attempt {attempt})");

            self.port.write_all(block)?;
            self.port.flush()?;

            match self.read_byte()? {
                Some(control::ACK) => {
                    trace!("Block {index} ACKed");
                    return Ok(());
                },
                Some(control::NAK) => debug!("Block {index} NAKed, resending"),
                Some(control::CAN) => {
                    return Err(TransferFailure::ReceiverCancelled { block: index }.into());
                },
                Some(c) => debug!("Unexpected reply 0x{c:02X} to block {index}, resending"),
                None => debug!("Timeout waiting for ACK of block {index}, resending"),
            }
        }

        Err(TransferFailure::ProtocolRetryExhausted { block: index }.into())
    }

    /// Send EOT until ACKed.
    fn send_eot(&mut self, index: u32) -> Result<()> {
        debug!("Sending EOT");

        for _ in 0..self.config.max_retries {
            self.port.write_all(&[control::EOT])?;
            self.port.flush()?;

            match self.read_byte()? {
                Some(control::ACK) => {
                    debug!("EOT ACKed");
                    return Ok(());
                },
                Some(control::CAN) => {
                    return Err(TransferFailure::ReceiverCancelled { block: index }.into());
                },
                // Receivers commonly NAK the first EOT
                _ => {},
            }
        }

        Err(TransferFailure::ProtocolRetryExhausted { block: index }.into())
    }

    /// Transfer `data`.
    ///
    /// `progress` is called after every acknowledged block with
    /// `(block_index, bytes_sent, total_bytes)`. Returns the number of blocks
    /// sent.
    pub fn transfer<F>(&mut self, data: &[u8], mut progress: F) -> Result<u32>
    where
        F: FnMut(u32, usize, usize),
    {
        debug!("Starting XMODEM transfer ({} bytes)", data.len());

        let mode = self.wait_for_start()?;

        let total = data.len();
        let mut seq: u8 = 1;
        let mut index: u32 = 0;

        for chunk in data.chunks(BLOCK_SIZE) {
            index += 1;
            let block = build_block(seq, chunk, mode);
            self.send_block(&block, index)?;

            seq = seq.wrapping_add(1);
            let sent = (index as usize * BLOCK_SIZE).min(total);
            progress(index, sent, total);
        }

        self.send_eot(index + 1)?;

        debug!("XMODEM transfer complete ({index} blocks)");
        Ok(index)
    }
}
