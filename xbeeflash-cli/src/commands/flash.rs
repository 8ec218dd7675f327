//! Flash and run command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use xbeeflash::{FirmwareFlasher, FirmwareImage, Recovery, Reliability, UploadMethod};
use xbeeflash::flash::Verification;

use crate::commands::recover::{Escalation, bring_to_bootloader};
use crate::config::Config;
use crate::{Cli, CliError, get_port, open_transport, recovery_config, use_fancy_output, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted before the transfer started".to_string()).into())
    } else {
        Ok(())
    }
}

fn transfer_progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    let progress_style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(progress_style);
    pb
}

fn upload_method(raw: bool, config: &Config) -> UploadMethod {
    if raw {
        UploadMethod::RawChunks
    } else {
        config.upload_method().unwrap_or_else(UploadMethod::detect)
    }
}

fn report_verification(verification: &Verification) {
    if verification.low_confidence {
        eprintln!(
            "{} Firmware answers at {} baud but did not acknowledge command mode",
            style("⚠").yellow(),
            verification.baud_rate
        );
    } else {
        eprintln!(
            "{} Firmware running at {} baud ({})",
            style("✓").green(),
            verification.baud_rate,
            verification.state
        );
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    raw: bool,
    escalation: Escalation,
) -> Result<()> {
    escalation.check(cli.non_interactive)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    let settings = recovery_config(cli, config)?;
    let method = upload_method(raw, config);
    let flasher = FirmwareFlasher::new(method)?
        .with_verification_bauds(&settings.candidate_baud_rates)
        .with_gate_timeout(settings.gate_timeout);

    if !cli.quiet {
        eprintln!(
            "{} {} bytes, {} blocks, via {}",
            style("ℹ").blue(),
            image.size_bytes(),
            image.block_count(),
            method
        );
        if method.reliability() == Reliability::BestEffort {
            eprintln!(
                "{} Raw upload is not acknowledged; only the post-flash probe checks it",
                style("⚠").yellow()
            );
        }
    }

    let port = get_port(cli, config)?;
    let recovery = Recovery::new(settings);
    let mut transport = open_transport(&port);

    let baud = bring_to_bootloader(cli, &recovery, &mut transport, escalation)?.into_baud()?;
    ensure_not_interrupted()?;
    if !cli.quiet {
        eprintln!(
            "{} Bootloader ready at {} baud, uploading",
            style("✓").green(),
            baud
        );
    }

    let pb = transfer_progress_bar(cli, image.size_bytes());
    let outcome = flasher.transfer(&mut transport, &image, |p| {
        pb.set_position(p.bytes_sent as u64);
        if p.is_complete() {
            pb.set_message("verifying");
        }
    });
    pb.finish_and_clear();
    transport.close();

    let report = outcome
        .into_result()
        .map_err(|e| CliError::Failed(format!("firmware transfer failed: {e}")))?;

    if !cli.quiet {
        eprintln!(
            "{} Sent {} bytes in {} blocks via {}",
            style("✓").green(),
            report.progress.bytes_sent,
            report.progress.block_index,
            report.method
        );
        report_verification(&report.verification);
    }
    Ok(())
}

/// Run command implementation: start the resident firmware from the bootloader.
pub(crate) fn cmd_run(cli: &Cli, config: &Config) -> Result<()> {
    let settings = recovery_config(cli, config)?;
    let flasher = FirmwareFlasher::new(upload_method(false, config))?
        .with_verification_bauds(&settings.candidate_baud_rates)
        .with_gate_timeout(settings.gate_timeout);

    let port = get_port(cli, config)?;
    let mut transport = open_transport(&port);

    if !cli.quiet {
        eprintln!(
            "{} Starting resident firmware on {}",
            style("▶").cyan(),
            style(&port).green()
        );
    }

    let verification = flasher.launch(&mut transport);
    transport.close();
    let verification =
        verification.map_err(|e| CliError::Failed(format!("firmware did not start: {e}")))?;

    if !cli.quiet {
        report_verification(&verification);
    }
    Ok(())
}
