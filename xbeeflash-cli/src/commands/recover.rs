//! Recovery command and the shared bring-to-bootloader step.

use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use log::debug;
use xbeeflash::{NativeOpener, Recovery, RecoveryOutcome, Transition, Transport};

use crate::config::Config;
use crate::serial::map_prompt_error;
use crate::{Cli, CliError, get_port, open_transport, recovery_config, was_interrupted};

/// Operator consent for the control-line reset.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Escalation {
    hardware_reset: bool,
    assume_yes: bool,
}

impl Escalation {
    pub(crate) fn new(hardware_reset: bool, assume_yes: bool) -> Self {
        Self {
            hardware_reset,
            assume_yes,
        }
    }

    /// Reject combinations that would need a prompt we are not allowed to show.
    pub(crate) fn check(self, non_interactive: bool) -> Result<()> {
        if self.hardware_reset && non_interactive && !self.assume_yes {
            return Err(CliError::Usage(
                "--hardware-reset needs --yes in non-interactive mode".to_string(),
            )
            .into());
        }
        Ok(())
    }

    fn confirmed(self, port: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Force bootloader entry on {port} with DTR/RTS/break? The radio will be reset"
            ))
            .default(false)
            .interact_opt()
            .map_err(map_prompt_error)?;
        Ok(answer.unwrap_or(false))
    }
}

/// Where recovery left the radio.
pub(crate) struct Reached {
    pub(crate) outcome: RecoveryOutcome,
    /// Result of the control-line reset, when one was performed.
    pub(crate) hardware: Option<Transition>,
}

impl Reached {
    pub(crate) fn bootloader_baud(&self) -> Option<u32> {
        match (&self.outcome, &self.hardware) {
            (RecoveryOutcome::Bootloader { baud, .. }, _)
            | (_, Some(Transition::Bootloader { baud })) => Some(*baud),
            _ => None,
        }
    }

    /// Bootloader baud rate, or the reason it was not reached.
    pub(crate) fn into_baud(self) -> Result<u32> {
        if let Some(baud) = self.bootloader_baud() {
            return Ok(baud);
        }
        match self.outcome {
            RecoveryOutcome::Cancelled { last_state, .. } => Err(CliError::Cancelled(format!(
                "recovery cancelled, radio last seen in {last_state}"
            ))
            .into()),
            RecoveryOutcome::Failed {
                last_state, reason, ..
            } => Err(CliError::Failed(format!(
                "radio not recovered: {reason} (last state: {last_state})"
            ))
            .into()),
            RecoveryOutcome::Bootloader { baud, .. } => Ok(baud),
        }
    }
}

fn transition_label(transition: &Transition) -> String {
    match transition {
        Transition::Bootloader { baud } => format!("bootloader at {baud} baud"),
        Transition::NoTransition => "no transition".to_string(),
        Transition::Failed { from, observed } => format!("{from} -> {observed}"),
        Transition::Unresolved { observed } => format!("unresolved ({observed})"),
    }
}

fn outcome_label(outcome: &RecoveryOutcome) -> &'static str {
    match outcome {
        RecoveryOutcome::Bootloader { .. } => "bootloader",
        RecoveryOutcome::Failed { .. } => "failed",
        RecoveryOutcome::Cancelled { .. } => "cancelled",
    }
}

/// Run the orchestrator, then the control-line reset if the operator allowed it.
pub(crate) fn bring_to_bootloader(
    cli: &Cli,
    recovery: &Recovery,
    transport: &mut Transport<NativeOpener>,
    escalation: Escalation,
) -> Result<Reached> {
    let config = recovery.config();
    if !cli.quiet {
        eprintln!(
            "{} Recovering {} (up to {} attempts over {:?} baud)",
            style("🔧").cyan(),
            style(transport.path()).green(),
            config.max_attempts,
            config.candidate_baud_rates
        );
    }

    let outcome = recovery.run(transport)?;

    let hardware = match &outcome {
        RecoveryOutcome::Failed {
            last_state, reason, ..
        } if escalation.hardware_reset && !was_interrupted() => {
            eprintln!(
                "{} Automatic recovery failed: {reason}",
                style("⚠").yellow()
            );
            if escalation.confirmed(transport.path())? {
                let transition = recovery
                    .controller()
                    .force_hardware_entry(transport, *last_state)
                    .context("hardware bootloader entry failed")?;
                debug!("Hardware entry: {}", transition_label(&transition));
                Some(transition)
            } else {
                eprintln!("{} Hardware reset skipped", style("ℹ").blue());
                None
            }
        },
        _ => None,
    };

    Ok(Reached { outcome, hardware })
}

fn report_json(reached: &Reached) -> serde_json::Value {
    let reason = match &reached.outcome {
        RecoveryOutcome::Failed { reason, .. } => Some(reason.to_string()),
        _ => None,
    };
    serde_json::json!({
        "outcome": outcome_label(&reached.outcome),
        "bootloader_baud": reached.bootloader_baud(),
        "last_state": reached.outcome.last_state(),
        "reason": reason,
        "hardware_reset": reached.hardware.as_ref().map(transition_label),
        "session": reached.outcome.session(),
    })
}

/// Recover command implementation.
pub(crate) fn cmd_recover(
    cli: &Cli,
    config: &Config,
    json: bool,
    escalation: Escalation,
) -> Result<()> {
    escalation.check(cli.non_interactive)?;
    let recovery = Recovery::new(recovery_config(cli, config)?);
    let port = get_port(cli, config)?;
    let mut transport = open_transport(&port);

    let reached = bring_to_bootloader(cli, &recovery, &mut transport, escalation)?;
    transport.close();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report_json(&reached)).unwrap_or_default()
        );
    } else if !cli.quiet {
        let session = reached.outcome.session();
        for record in session.failures() {
            eprintln!(
                "  {} attempt {} at {} baud: {}",
                style("✗").red(),
                record.attempt,
                record.baud_rate,
                record.failure
            );
        }
        if let Some(baud) = reached.bootloader_baud() {
            eprintln!(
                "{} Bootloader ready at {} baud after {} attempt(s)",
                style("✓").green(),
                baud,
                session.attempts()
            );
        }
    }

    reached.into_baud().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xbeeflash::DeviceState;

    #[test]
    fn test_escalation_needs_yes_when_non_interactive() {
        let err = Escalation::new(true, false).check(true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));

        assert!(Escalation::new(true, true).check(true).is_ok());
        assert!(Escalation::new(true, false).check(false).is_ok());
        assert!(Escalation::new(false, false).check(true).is_ok());
    }

    #[test]
    fn test_assume_yes_skips_prompt() {
        assert!(Escalation::new(true, true).confirmed("/dev/ttyUSB0").unwrap());
    }

    #[test]
    fn test_transition_labels() {
        assert_eq!(
            transition_label(&Transition::Bootloader { baud: 115200 }),
            "bootloader at 115200 baud"
        );
        assert_eq!(
            transition_label(&Transition::Failed {
                from: DeviceState::CommandMode,
                observed: DeviceState::Unresponsive,
            }),
            "command mode -> unresponsive"
        );
    }
}
