//! Recovery orchestration: find the radio and bring it to the bootloader.
//!
//! Each attempt picks the next candidate baud rate (cycling through the
//! list), waits for the transport gate, probes, and drives the detected state
//! towards the bootloader. A failed attempt closes the transport and backs
//! off before the next one, giving a network bridge time to settle.
//!
//! Cancellation is only honoured between attempts. Interrupting a probe
//! half way can leave the radio stuck in command mode.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::{DEFAULT_GATE_TIMEOUT, GateStatus, Transport};
use crate::device::{DeviceState, ModeController, ProbeEngine, ProbeResult, Transition};
use crate::error::{AttemptFailure, Error, Result};
use crate::port::PortOpener;
use crate::protocol::commands::DEFAULT_BAUD_RATES;

/// Default pause between failed attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Caller-provided stop signal, checked between attempts.
pub type StopSignal = Arc<dyn Fn() -> bool + Send + Sync>;

/// Tunable parts of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Baud rates to try, in order.
    pub candidate_baud_rates: Vec<u32>,
    /// Upper bound on probe/transition cycles.
    pub max_attempts: u32,
    /// Pause after a failed attempt.
    pub backoff: Duration,
    /// How long to wait for the device path each time.
    pub gate_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            candidate_baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            max_attempts: u32::try_from(DEFAULT_BAUD_RATES.len()).unwrap_or(u32::MAX),
            backoff: DEFAULT_BACKOFF,
            gate_timeout: DEFAULT_GATE_TIMEOUT,
        }
    }
}

impl RecoveryConfig {
    /// Check that a run can make at least one attempt.
    pub fn validate(&self) -> Result<()> {
        if self.candidate_baud_rates.is_empty() {
            return Err(Error::Config("no candidate baud rates".into()));
        }
        if self.candidate_baud_rates.contains(&0) {
            return Err(Error::Config("baud rate 0 is not valid".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Baud rate used by the 1-based `attempt`.
    pub fn baud_for_attempt(&self, attempt: u32) -> u32 {
        let index = (attempt.saturating_sub(1) as usize) % self.candidate_baud_rates.len();
        self.candidate_baud_rates[index]
    }
}

/// A failed attempt, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Rate the attempt probed at.
    pub baud_rate: u32,
    /// Why it failed.
    pub failure: AttemptFailure,
}

/// State of one recovery run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecoverySession {
    device_path: String,
    candidate_baud_rates: Vec<u32>,
    attempts: u32,
    current_state: DeviceState,
    resolved_baud_rate: Option<u32>,
    last_probe: Option<ProbeResult>,
    failures: Vec<AttemptRecord>,
}

impl RecoverySession {
    fn new(device_path: &str, candidate_baud_rates: &[u32]) -> Self {
        Self {
            device_path: device_path.to_string(),
            candidate_baud_rates: candidate_baud_rates.to_vec(),
            attempts: 0,
            current_state: DeviceState::Unresponsive,
            resolved_baud_rate: None,
            last_probe: None,
            failures: Vec::new(),
        }
    }

    /// Transport path being recovered.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Rates cycled through, in order.
    pub fn candidate_baud_rates(&self) -> &[u32] {
        &self.candidate_baud_rates
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last observed device state.
    pub fn current_state(&self) -> DeviceState {
        self.current_state
    }

    /// Baud rate the bootloader was reached at.
    pub fn resolved_baud_rate(&self) -> Option<u32> {
        self.resolved_baud_rate
    }

    /// Most recent probe, if any probe ran.
    pub fn last_probe(&self) -> Option<&ProbeResult> {
        self.last_probe.as_ref()
    }

    /// Every failed attempt, oldest first.
    pub fn failures(&self) -> &[AttemptRecord] {
        &self.failures
    }
}

/// How a recovery run ended.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// The bootloader is ready; the transport is left open at `baud`.
    Bootloader {
        /// Bootloader baud rate.
        baud: u32,
        /// Attempt history.
        session: RecoverySession,
    },
    /// The attempt budget ran out, or an attempt needs an operator.
    Failed {
        /// Last observed device state.
        last_state: DeviceState,
        /// Failure of the final attempt.
        reason: AttemptFailure,
        /// Attempt history.
        session: RecoverySession,
    },
    /// The stop signal fired between attempts.
    Cancelled {
        /// Last observed device state.
        last_state: DeviceState,
        /// Attempt history.
        session: RecoverySession,
    },
}

impl RecoveryOutcome {
    /// Whether the bootloader was reached.
    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::Bootloader { .. })
    }

    /// The run's session record.
    pub fn session(&self) -> &RecoverySession {
        match self {
            Self::Bootloader { session, .. }
            | Self::Failed { session, .. }
            | Self::Cancelled { session, .. } => session,
        }
    }

    /// Last observed device state.
    pub fn last_state(&self) -> DeviceState {
        match self {
            Self::Bootloader { .. } => DeviceState::Bootloader,
            Self::Failed { last_state, .. } | Self::Cancelled { last_state, .. } => *last_state,
        }
    }

    /// Bootloader baud rate, or the failure as an [`Error`].
    pub fn into_result(self) -> Result<u32> {
        match self {
            Self::Bootloader { baud, .. } => Ok(baud),
            Self::Failed { reason, .. } => Err(Error::Recovery(reason)),
            Self::Cancelled { .. } => Err(Error::Recovery(AttemptFailure::Cancelled)),
        }
    }
}

/// The recovery orchestrator.
#[derive(Clone)]
pub struct Recovery {
    config: RecoveryConfig,
    probe: ProbeEngine,
    controller: ModeController,
    stop: StopSignal,
}

impl Recovery {
    /// Orchestrator honouring the global interrupt checker.
    pub fn new(config: RecoveryConfig) -> Self {
        let probe = ProbeEngine::new().with_gate_timeout(config.gate_timeout);
        let controller = ModeController::new().with_gate_timeout(config.gate_timeout);
        Self {
            config,
            probe,
            controller,
            stop: Arc::new(crate::is_interrupted_requested),
        }
    }

    /// Replace the stop signal.
    #[must_use]
    pub fn with_stop_signal<F>(mut self, stop: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.stop = Arc::new(stop);
        self
    }

    /// Settings this run was built with.
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Mode controller configured like this run, for operator-driven steps.
    pub fn controller(&self) -> &ModeController {
        &self.controller
    }

    /// Run until the bootloader is reached, the budget is spent, or the stop
    /// signal fires.
    ///
    /// `Err` is only returned for an unusable configuration; every device or
    /// transport problem ends up in the outcome.
    pub fn run<O: PortOpener>(&self, transport: &mut Transport<O>) -> Result<RecoveryOutcome> {
        self.config.validate()?;

        let max = self.config.max_attempts;
        let mut session = RecoverySession::new(transport.path(), &self.config.candidate_baud_rates);
        let mut last_failure = AttemptFailure::ProbeInconclusive {
            baud: self.config.baud_for_attempt(1),
        };

        for attempt in 1..=max {
            if (self.stop)() {
                info!("Recovery cancelled before attempt {attempt}");
                transport.close();
                return Ok(RecoveryOutcome::Cancelled {
                    last_state: session.current_state,
                    session,
                });
            }

            let baud = self.config.baud_for_attempt(attempt);
            session.attempts = attempt;
            info!("Attempt {attempt}/{max} at {baud} baud");

            match self.attempt(transport, &mut session, baud, attempt == 1) {
                Ok(resolved) => {
                    session.current_state = DeviceState::Bootloader;
                    session.resolved_baud_rate = Some(resolved);
                    info!("Bootloader reached at {resolved} baud after {attempt} attempt(s)");
                    return Ok(RecoveryOutcome::Bootloader {
                        baud: resolved,
                        session,
                    });
                },
                Err(failure) => {
                    warn!("Attempt {attempt}/{max} at {baud} baud failed: {failure}");
                    session.failures.push(AttemptRecord {
                        attempt,
                        baud_rate: baud,
                        failure: failure.clone(),
                    });
                    transport.close();

                    if let AttemptFailure::UnresolvedAlive { .. } = failure {
                        warn!("Device needs operator intervention, not retrying");
                        return Ok(RecoveryOutcome::Failed {
                            last_state: session.current_state,
                            reason: failure,
                            session,
                        });
                    }
                    last_failure = failure;

                    if attempt < max {
                        debug!("Backing off for {:?}", self.config.backoff);
                        transport.clock().sleep(self.config.backoff);
                    }
                },
            }
        }

        warn!("Recovery failed after {max} attempt(s), last state {}", session.current_state);
        Ok(RecoveryOutcome::Failed {
            last_state: session.current_state,
            reason: last_failure,
            session,
        })
    }

    fn attempt<O: PortOpener>(
        &self,
        transport: &mut Transport<O>,
        session: &mut RecoverySession,
        baud: u32,
        first: bool,
    ) -> std::result::Result<u32, AttemptFailure> {
        if !(first && transport.is_open())
            && transport.await_available(self.config.gate_timeout) == GateStatus::TimedOut
        {
            return Err(AttemptFailure::TransportUnavailable);
        }

        let probe = self.probe.probe(transport, baud)?;
        session.current_state = probe.state();
        let transition = self.controller.drive(transport, &probe);
        session.last_probe = Some(probe);

        match transition? {
            Transition::Bootloader { baud } => Ok(baud),
            Transition::NoTransition => Err(AttemptFailure::ProbeInconclusive { baud }),
            Transition::Failed { from, observed } => {
                session.current_state = observed;
                Err(AttemptFailure::ModeTransitionFailed { from, observed })
            },
            Transition::Unresolved { observed } => {
                session.current_state = observed;
                Err(AttemptFailure::UnresolvedAlive { baud })
            },
        }
    }
}

/// Recover the radio on `path` with default timings.
///
/// Returns the outcome together with the transport, which is left open at
/// the bootloader baud rate on success.
#[cfg(feature = "native")]
pub fn recover(
    path: &str,
    candidate_baud_rates: &[u32],
    max_attempts: u32,
) -> Result<(RecoveryOutcome, Transport<crate::port::NativeOpener>)> {
    let config = RecoveryConfig {
        candidate_baud_rates: candidate_baud_rates.to_vec(),
        max_attempts,
        ..RecoveryConfig::default()
    };
    let mut transport = Transport::new(
        crate::port::NativeOpener,
        path,
        crate::clock::SystemClock::shared(),
    );
    let outcome = Recovery::new(config).run(&mut transport)?;
    Ok((outcome, transport))
}
