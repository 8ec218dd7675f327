//! Probe engine: classify the radio at one baud rate.
//!
//! Steps run strictly one after another, each followed by a bounded read
//! window, so the line is idle before the next one starts.
//!
//! ```text
//!   guard 1.5s | +++ | guard 1.5s | read
//!   \r\n       | 2s  | read
//!   AT%F\r     | 3s  | read
//!   7E .. DC   | 2s  | read
//!   00 x5      | 2s  | read
//! ```
//!
//! The API frame asks for a reset, so it is only sent to a line that has
//! stayed silent so far.

use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::connection::{DEFAULT_GATE_TIMEOUT, Transport};
use crate::device::{DeviceState, ProbeResult, ResponseBuffer};
use crate::error::Result;
use crate::port::PortOpener;
use crate::protocol::commands::{DIRECT_INVOKE, LINE_ENDING, MODE_ENTRY, NULL_PROBE};
use crate::protocol::ApiFrame;

/// Silence required on each side of the mode-entry sequence.
pub const GUARD_INTERVAL: Duration = Duration::from_millis(1500);

/// How long each step listens for an answer.
pub const PROBE_WINDOW: Duration = Duration::from_secs(5);

/// One classification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ProbeStep {
    /// Guarded `+++`.
    ModeEntry,
    /// Benign `\r\n`.
    LineEnding,
    /// Direct bootloader command.
    DirectInvoke,
    /// Structured API frame.
    ApiFrame,
    /// Five zero bytes.
    NullBytes,
}

impl ProbeStep {
    /// Priority order.
    pub const ALL: [Self; 5] = [
        Self::ModeEntry,
        Self::LineEnding,
        Self::DirectInvoke,
        Self::ApiFrame,
        Self::NullBytes,
    ];

    /// Bytes written for this step.
    pub fn payload(self) -> Vec<u8> {
        match self {
            Self::ModeEntry => MODE_ENTRY.to_vec(),
            Self::LineEnding => LINE_ENDING.to_vec(),
            Self::DirectInvoke => DIRECT_INVOKE.to_vec(),
            Self::ApiFrame => ApiFrame::reset_probe().encode(),
            Self::NullBytes => NULL_PROBE.to_vec(),
        }
    }

    /// Whether the step can reset a radio that is already talking.
    pub fn is_forced_reset(self) -> bool {
        self == Self::ApiFrame
    }

    /// Wait between the write and the read window.
    pub fn delay(self) -> Duration {
        match self {
            Self::ModeEntry => GUARD_INTERVAL,
            Self::DirectInvoke => Duration::from_secs(3),
            Self::LineEnding | Self::ApiFrame | Self::NullBytes => Duration::from_secs(2),
        }
    }
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ModeEntry => "mode entry",
            Self::LineEnding => "line ending",
            Self::DirectInvoke => "direct invoke",
            Self::ApiFrame => "API frame",
            Self::NullBytes => "null bytes",
        };
        f.write_str(name)
    }
}

/// Runs the probe sequence.
#[derive(Debug, Clone)]
pub struct ProbeEngine {
    steps: Vec<ProbeStep>,
    window: Duration,
    gate_timeout: Duration,
}

impl Default for ProbeEngine {
    fn default() -> Self {
        Self {
            steps: ProbeStep::ALL.to_vec(),
            window: PROBE_WINDOW,
            gate_timeout: DEFAULT_GATE_TIMEOUT,
        }
    }
}

impl ProbeEngine {
    /// Engine running every step with the default windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate timeout used when the probe has to change baud rate.
    #[must_use]
    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    /// Run only `steps`, in the given order.
    #[must_use]
    pub fn with_steps(mut self, steps: &[ProbeStep]) -> Self {
        self.steps = steps.to_vec();
        self
    }

    /// Probe at `baud`.
    ///
    /// Stops at the first step whose answer carries a complete marker. When
    /// no step does, the first non-silent answer is reported as
    /// [`DeviceState::UnknownAlive`]; otherwise the device is unresponsive.
    /// Once anything has answered, the forced-reset step is skipped.
    pub fn probe<O: PortOpener>(&self, transport: &mut Transport<O>, baud: u32) -> Result<ProbeResult> {
        let start = transport.clock().now();
        transport.ensure_open(baud, self.gate_timeout)?;
        debug!("Probing {} at {baud} baud", transport.path());

        let mut first_alive: Option<(ProbeStep, Vec<u8>)> = None;

        for &step in &self.steps {
            if step.is_forced_reset() && first_alive.is_some() {
                debug!("Skipping {step} at {baud}: device already answered");
                continue;
            }
            let response = self.run_step(transport, step)?;
            let state = response.state();
            debug!("{step} at {baud}: {state} ({} bytes)", response.as_bytes().len());

            if response.is_conclusive() {
                let elapsed = transport.clock().since(start);
                info!("Detected {state} at {baud} baud via {step}");
                return Ok(ProbeResult::new(state, baud, response.into_bytes(), elapsed, Some(step)));
            }
            if state.is_alive() && first_alive.is_none() {
                first_alive = Some((step, response.into_bytes()));
            }
        }

        let elapsed = transport.clock().since(start);
        Ok(match first_alive {
            Some((step, raw)) => {
                info!("Device alive at {baud} baud but no known marker");
                ProbeResult::new(DeviceState::UnknownAlive, baud, raw, elapsed, Some(step))
            },
            None => {
                debug!("No response at {baud} baud");
                ProbeResult::new(DeviceState::Unresponsive, baud, Vec::new(), elapsed, None)
            },
        })
    }

    /// Probe every rate in `bauds` without attempting any transition.
    pub fn scan<O: PortOpener>(&self, transport: &mut Transport<O>, bauds: &[u32]) -> Result<Vec<ProbeResult>> {
        bauds.iter().map(|&baud| self.probe(transport, baud)).collect()
    }

    fn run_step<O: PortOpener>(&self, transport: &mut Transport<O>, step: ProbeStep) -> Result<ResponseBuffer> {
        transport.discard_input()?;

        if step == ProbeStep::ModeEntry {
            transport.clock().sleep(GUARD_INTERVAL);
        }
        transport.send(&step.payload())?;
        transport.clock().sleep(step.delay());

        transport.collect(self.window, true)
    }
}
