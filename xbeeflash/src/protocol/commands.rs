//! Command vocabulary and response markers.
//!
//! Bytes sent to the radio and the text it answers with. The radio speaks
//! three dialects depending on its state: transparent data (where only the
//! guarded `+++` escape is special), AT command mode, and the Gecko
//! bootloader's single-key menu.

use byteorder::{BigEndian, WriteBytesExt};

/// Mode-entry escape. Must be surrounded by guard intervals and sent without
/// a line terminator.
pub const MODE_ENTRY: &[u8] = b"+++";

/// Harmless line terminator.
pub const LINE_ENDING: &[u8] = b"\r\n";

/// Direct bootloader request understood by firmware outside command mode.
pub const DIRECT_INVOKE: &[u8] = b"AT%F\r";

/// Bootloader-invoke command, sent from command mode.
pub const BOOTLOADER_INVOKE: &[u8] = b"AT%P\r";

/// Exit command mode.
pub const EXIT_COMMAND_MODE: &[u8] = b"ATCN\r";

/// Null probe: anything that echoes will answer this.
pub const NULL_PROBE: &[u8] = &[0x00; 5];

/// Ask the bootloader to print its menu.
pub const PROMPT_REQUEST: &[u8] = b"\r";

/// Bootloader menu key: receive a new image.
pub const MENU_UPLOAD: u8 = b'1';

/// Bootloader menu key: run the application.
pub const MENU_RUN: u8 = b'2';

/// Command-mode acknowledgment.
pub const COMMAND_MODE_ACK: &str = "OK";

/// Bootloader banner text.
pub const BOOTLOADER_BANNER: &str = "Gecko Bootloader";

/// Bootloader menu prompt.
pub const BOOTLOADER_PROMPT: &str = "BL >";

/// Baud rate the bootloader always runs at.
pub const CANONICAL_BOOTLOADER_BAUD: u32 = 115200;

/// Candidate baud rates, most likely first.
pub const DEFAULT_BAUD_RATES: &[u32] = &[115200, 9600, 38400, 19200, 57600];

/// Firmware-info queries issued in command mode.
pub mod at {
    /// Firmware version.
    pub const FIRMWARE_VERSION: &str = "VR";
    /// Serial number, high word.
    pub const SERIAL_HIGH: &str = "SH";
    /// Serial number, low word.
    pub const SERIAL_LOW: &str = "SL";
    /// Interface baud rate.
    pub const BAUD_RATE: &str = "BD";
    /// API mode.
    pub const API_MODE: &str = "AP";
    /// Coordinator enable.
    pub const COORDINATOR_ENABLE: &str = "CE";
    /// PAN id.
    pub const PAN_ID: &str = "ID";

    /// Queries issued by a full info dump, with labels.
    pub const INFO_QUERIES: &[(&str, &str)] = &[
        (FIRMWARE_VERSION, "Firmware version"),
        (SERIAL_HIGH, "Serial number high"),
        (SERIAL_LOW, "Serial number low"),
        (BAUD_RATE, "Baud rate"),
        (API_MODE, "API mode"),
        (COORDINATOR_ENABLE, "Coordinator enable"),
        (PAN_ID, "PAN ID"),
    ];

    /// Encode an AT query as sent on the wire: `AT<cmd>\r`.
    #[must_use]
    pub fn encode(command: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(command.len() + 3);
        out.extend_from_slice(b"AT");
        out.extend_from_slice(command.as_bytes());
        out.push(b'\r');
        out
    }
}

/// API frame start delimiter.
pub const API_START: u8 = 0x7E;

/// Frame type used for the forced-reset probe.
pub const API_RESET_FRAME_TYPE: u8 = 0x23;

/// A low-level API frame.
///
/// ```text
/// +------+--------+------+------+----------+
/// | 0x7E | LEN BE | TYPE | DATA | CHECKSUM |
/// +------+--------+------+------+----------+
/// ```
///
/// The checksum is `0xFF` minus the low byte of the sum of TYPE and DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFrame {
    frame_type: u8,
    data: Vec<u8>,
}

impl ApiFrame {
    /// Create a frame.
    pub fn new(frame_type: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            frame_type,
            data: data.into(),
        }
    }

    /// The frame sent to devices that only answer structured frames.
    #[must_use]
    pub fn reset_probe() -> Self {
        Self::new(API_RESET_FRAME_TYPE, [0x00])
    }

    /// Checksum over the frame payload.
    #[must_use]
    pub fn checksum(&self) -> u8 {
        let sum = self
            .data
            .iter()
            .fold(self.frame_type, |acc, b| acc.wrapping_add(*b));
        0xFF - sum
    }

    /// Encode to wire bytes.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = (self.data.len() + 1) as u16;
        let mut out = Vec::with_capacity(self.data.len() + 5);
        out.push(API_START);
        // Writing into a Vec cannot fail
        let _ = out.write_u16::<BigEndian>(len);
        out.push(self.frame_type);
        out.extend_from_slice(&self.data);
        out.push(self.checksum());
        out
    }
}
