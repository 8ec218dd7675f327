//! Probe and info command implementations.
//!
//! Both are read-only: neither drives the radio out of its current mode.

use anyhow::{Context, Result};
use console::style;
use xbeeflash::device::at::{FirmwareInfo, read_firmware_info};
use xbeeflash::{DeviceState, ProbeEngine, ProbeResult};

use crate::config::Config;
use crate::{Cli, CliError, get_port, open_transport, recovery_config};

fn probe_json(result: &ProbeResult) -> serde_json::Value {
    serde_json::json!({
        "baud_rate": result.baud_rate(),
        "state": result.state(),
        "step": result.step().map(|s| s.to_string()),
        "response": result.response_text(),
        "elapsed_ms": u64::try_from(result.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

fn state_style(state: DeviceState) -> console::StyledObject<String> {
    let text = state.to_string();
    match state {
        DeviceState::Bootloader | DeviceState::CommandMode => style(text).green(),
        DeviceState::UnknownAlive => style(text).yellow(),
        DeviceState::Unresponsive => style(text).dim(),
    }
}

/// Probe command implementation.
pub(crate) fn cmd_probe(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let settings = recovery_config(cli, config)?;
    let port = get_port(cli, config)?;
    let mut transport = open_transport(&port);

    if !cli.quiet {
        eprintln!(
            "{} Probing {} at {:?} baud",
            style("🔍").cyan(),
            style(&port).green(),
            settings.candidate_baud_rates
        );
    }

    let engine = ProbeEngine::new().with_gate_timeout(settings.gate_timeout);
    let results = engine
        .scan(&mut transport, &settings.candidate_baud_rates)
        .with_context(|| format!("Probe failed on {port}"));
    transport.close();
    let results = results?;

    if json {
        let values: Vec<serde_json::Value> = results.iter().map(probe_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&values).unwrap_or_default()
        );
    } else if !cli.quiet {
        for result in &results {
            let via = result
                .step()
                .map(|s| format!(" via {s}"))
                .unwrap_or_default();
            eprintln!(
                "  {:>7} baud: {}{}",
                result.baud_rate(),
                state_style(result.state()),
                style(via).dim()
            );
        }
    }

    if results.iter().any(|r| r.state().is_alive()) {
        Ok(())
    } else {
        Err(CliError::Failed("no response at any candidate baud rate".to_string()).into())
    }
}

fn print_info(info: &FirmwareInfo) {
    eprintln!(
        "{}",
        style(format!("Radio at {} baud", info.baud_rate))
            .bold()
            .underlined()
    );
    for entry in &info.entries {
        eprintln!(
            "  {:<20} {} {}",
            entry.label,
            style(&entry.value).cyan(),
            style(format!("(AT{})", entry.command)).dim()
        );
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let settings = recovery_config(cli, config)?;
    let port = get_port(cli, config)?;
    let mut transport = open_transport(&port);

    let info = read_firmware_info(
        &mut transport,
        &settings.candidate_baud_rates,
        settings.gate_timeout,
    )
    .with_context(|| format!("Command-mode query failed on {port}"));
    transport.close();

    let Some(info) = info? else {
        return Err(CliError::Failed(
            "command mode did not answer at any candidate baud rate".to_string(),
        )
        .into());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
    } else {
        print_info(&info);
    }
    Ok(())
}
