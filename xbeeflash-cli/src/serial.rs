//! Serial port selection.
//!
//! Order: explicit `--port`, then the configured port, then a single
//! auto-detected adapter, then an interactive pick. Non-interactive runs never
//! prompt; an ambiguous or empty port list is a usage error there.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::debug,
    std::io::IsTerminal,
    xbeeflash::{DetectedPort, connection::detect},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Resolve the serial port to use.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port) = &options.port {
        return Ok(port.clone());
    }

    if let Some(port) = &config.connection.port {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    choose_port(detect::detect_ports(), options.non_interactive, select_port_interactive)
}

/// Pick from `ports` without prompting when the choice is clear.
fn choose_port<F>(ports: Vec<DetectedPort>, non_interactive: bool, prompt: F) -> Result<String>
where
    F: FnOnce(Vec<DetectedPort>) -> Result<DetectedPort>,
{
    if ports.is_empty() {
        return Err(usage_err("no serial ports found; connect the radio or pass --port"));
    }

    if let Some(port) = detect::pick_unambiguous(ports.clone()) {
        return Ok(port.name);
    }

    if non_interactive {
        return Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        ));
    }

    ensure_interactive_terminal()?;
    prompt(ordered_for_selection(ports)).map(|port| port.name)
}

/// Likely radios first, in bridge priority order, then everything else.
fn ordered_for_selection(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    let (radios, others): (Vec<_>, Vec<_>) =
        ports.into_iter().partition(DetectedPort::is_likely_radio);
    let mut ordered = detect::radio_candidates(radios);
    ordered.extend(others);
    ordered
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or use --non-interactive",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("selection cancelled".to_string()).into()
            } else {
                usage_err("interactive prompt failed")
            }
        },
    }
}

fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    eprintln!(
        "{} {} serial ports found",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = if port.is_likely_radio() {
                style(port.describe()).bold().to_string()
            } else {
                port.describe()
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the radio's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("selection cancelled".to_string()).into()),
    }
}
