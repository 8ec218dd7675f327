//! Response classification.
//!
//! Marker matching, not parsing: radios print diagnostics around the
//! markers, and a read may stop in the middle of one. A marker only counts
//! once all of its bytes are in the buffer.

use crate::device::DeviceState;
use crate::protocol::commands::{BOOTLOADER_BANNER, BOOTLOADER_PROMPT, COMMAND_MODE_ACK};

fn contains(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Map raw response bytes to a [`DeviceState`].
///
/// Total and deterministic. Bootloader markers win over the command-mode
/// acknowledgment; whitespace-only input counts as silence.
pub fn classify(raw: &[u8]) -> DeviceState {
    if contains(raw, BOOTLOADER_BANNER) || contains(raw, BOOTLOADER_PROMPT) {
        DeviceState::Bootloader
    } else if contains(raw, COMMAND_MODE_ACK) {
        DeviceState::CommandMode
    } else if raw.iter().all(u8::is_ascii_whitespace) {
        DeviceState::Unresponsive
    } else {
        DeviceState::UnknownAlive
    }
}

/// Accumulates partial reads and classifies the whole accumulation.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuffer {
    bytes: Vec<u8>,
}

impl ResponseBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read.
    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// Classification of everything received so far.
    pub fn state(&self) -> DeviceState {
        classify(&self.bytes)
    }

    /// Whether a complete marker has been seen.
    pub fn is_conclusive(&self) -> bool {
        matches!(
            self.state(),
            DeviceState::Bootloader | DeviceState::CommandMode
        )
    }

    /// Bytes received so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the accumulated bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Nothing received yet.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
