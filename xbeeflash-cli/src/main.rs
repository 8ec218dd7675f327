//! xbeeflash CLI - recover and reflash XBee radio modules.
//!
//! ## Features
//!
//! - Probe a radio at every candidate baud rate
//! - Drive it into the bootloader, retrying over a flaky transport
//! - Upload firmware over XMODEM (or raw chunks) and verify it runs
//! - Read firmware information from AT command mode
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use xbeeflash::{NativeOpener, RecoveryConfig, SystemClock, Transport};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the operator pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

const EXAMPLES: &str = "\
Examples:
  xbeeflash probe                      Classify the radio at every candidate baud rate
  xbeeflash -p /dev/ttyUSB0 recover    Bring the radio to its bootloader
  xbeeflash flash xb3-24.gbl           Recover, upload and verify new firmware
  xbeeflash --bauds 9600,115200 info   Read firmware details from command mode";

/// xbeeflash - recover and reflash XBee radios over unreliable serial links.
///
/// Environment variables:
///   XBEEFLASH_PORT              - Default serial port
///   XBEEFLASH_BAUDS             - Candidate baud rates, comma separated
///   XBEEFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "xbeeflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = EXAMPLES)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "XBEEFLASH_PORT")]
    port: Option<String>,

    /// Candidate baud rates, tried in order.
    #[arg(
        long,
        global = true,
        value_delimiter = ',',
        value_name = "LIST",
        env = "XBEEFLASH_BAUDS"
    )]
    bauds: Option<Vec<u32>>,

    /// Maximum recovery attempts.
    #[arg(long, global = true, value_name = "N")]
    attempts: Option<u32>,

    /// Pause between failed attempts, in seconds.
    #[arg(long, global = true, value_name = "SECS")]
    backoff: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "XBEEFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every candidate baud rate and report what answers.
    Probe {
        /// Print results as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Bring the radio into its bootloader.
    Recover {
        /// Print the recovery report as JSON on stdout.
        #[arg(long)]
        json: bool,

        /// If recovery fails, force the bootloader via DTR/RTS/break.
        #[arg(long)]
        hardware_reset: bool,

        /// Do not ask before a hardware reset.
        #[arg(short, long)]
        yes: bool,
    },

    /// Recover, upload firmware and verify the radio runs it.
    Flash {
        /// Firmware image (.gbl).
        firmware: PathBuf,

        /// Send unacknowledged raw chunks instead of XMODEM.
        #[arg(long)]
        raw: bool,

        /// If recovery fails, force the bootloader via DTR/RTS/break.
        #[arg(long)]
        hardware_reset: bool,

        /// Do not ask before a hardware reset.
        #[arg(short, long)]
        yes: bool,
    },

    /// Read firmware details from AT command mode.
    Info {
        /// Print details as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Start the firmware resident in flash from the bootloader.
    Run,

    /// List available serial ports.
    ListPorts {
        /// Print ports as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Failures that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Stopped by the operator (exit 130).
    #[error("{0}")]
    Cancelled(String),
    /// The device did not reach the requested state (exit 1).
    #[error("{0}")]
    Failed(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
            Self::Failed(_) => 1,
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "xbeeflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

fn install_interrupt_handler() {
    let handler = || {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!(
            "\n{} stopping after the current attempt (Ctrl-C again to abort now)",
            style("⚠").yellow()
        );
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        debug!("Ctrl-C handler not installed: {e}");
    }
    xbeeflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Probe { json } => commands::probe::cmd_probe(cli, &config, *json),
        Commands::Recover {
            json,
            hardware_reset,
            yes,
        } => commands::recover::cmd_recover(
            cli,
            &config,
            *json,
            commands::recover::Escalation::new(*hardware_reset, *yes),
        ),
        Commands::Flash {
            firmware,
            raw,
            hardware_reset,
            yes,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            firmware,
            *raw,
            commands::recover::Escalation::new(*hardware_reset, *yes),
        ),
        Commands::Info { json } => commands::probe::cmd_info(cli, &config, *json),
        Commands::Run => commands::flash::cmd_run(cli, &config),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}

/// Recovery settings: flags over environment over config files.
pub(crate) fn recovery_config(cli: &Cli, config: &Config) -> Result<RecoveryConfig> {
    let mut recovery = config.recovery_config();
    if let Some(bauds) = &cli.bauds {
        recovery.candidate_baud_rates.clone_from(bauds);
    }
    if let Some(attempts) = cli.attempts {
        recovery.max_attempts = attempts;
    }
    if let Some(secs) = cli.backoff {
        recovery.backoff = Duration::from_secs(secs);
    }
    recovery
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(recovery)
}

/// A closed transport on `port`; the library opens it through the gate.
pub(crate) fn open_transport(port: &str) -> Transport<NativeOpener> {
    Transport::new(NativeOpener, port, SystemClock::shared())
}
