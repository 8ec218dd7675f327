//! Radio state detection and mode control.
//!
//! - [`classify`]: pure mapping from response bytes to [`DeviceState`]
//! - [`probe`]: ordered classification probes at one baud rate
//! - [`mode`]: transitions from a detected state to the bootloader
//! - [`at`]: command-mode queries against running firmware

pub mod at;
pub mod classify;
pub mod mode;
pub mod probe;

use std::fmt;
use std::time::Duration;

pub use classify::{ResponseBuffer, classify};
pub use mode::{ModeController, Transition};
pub use probe::{ProbeEngine, ProbeStep};

/// What the radio appears to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceState {
    /// Nothing came back.
    Unresponsive,
    /// Running firmware, in AT command mode.
    CommandMode,
    /// Bootloader menu is active.
    Bootloader,
    /// Something answered, but no known marker was present.
    UnknownAlive,
}

impl DeviceState {
    /// Whether anything at all answered.
    #[must_use]
    pub fn is_alive(self) -> bool {
        !matches!(self, Self::Unresponsive)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresponsive => write!(f, "unresponsive"),
            Self::CommandMode => write!(f, "command mode"),
            Self::Bootloader => write!(f, "bootloader"),
            Self::UnknownAlive => write!(f, "alive (unknown mode)"),
        }
    }
}

/// Outcome of probing at one baud rate. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProbeResult {
    state: DeviceState,
    baud_rate: u32,
    raw_response: Vec<u8>,
    elapsed: Duration,
    step: Option<ProbeStep>,
}

impl ProbeResult {
    pub(crate) fn new(
        state: DeviceState,
        baud_rate: u32,
        raw_response: Vec<u8>,
        elapsed: Duration,
        step: Option<ProbeStep>,
    ) -> Self {
        Self {
            state,
            baud_rate,
            raw_response,
            elapsed,
            step,
        }
    }

    /// Classified state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Baud rate the probe ran at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Bytes that produced the classification (empty when unresponsive).
    pub fn raw_response(&self) -> &[u8] {
        &self.raw_response
    }

    /// Response as lossy text, for logs.
    pub fn response_text(&self) -> String {
        String::from_utf8_lossy(&self.raw_response).into_owned()
    }

    /// Wall time spent probing.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// The step that produced a conclusive answer, if any.
    pub fn step(&self) -> Option<ProbeStep> {
        self.step
    }
}
