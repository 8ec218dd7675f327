//! AT command-mode queries against running firmware.

use std::time::Duration;

use log::{debug, info};

use crate::connection::Transport;
use crate::device::DeviceState;
use crate::device::probe::GUARD_INTERVAL;
use crate::error::Result;
use crate::port::PortOpener;
use crate::protocol::commands::{EXIT_COMMAND_MODE, MODE_ENTRY, at};

/// How long to wait for the guarded escape to be acknowledged.
pub const ENTRY_WINDOW: Duration = Duration::from_secs(3);

/// How long to wait for the answer to one query.
pub const QUERY_WINDOW: Duration = Duration::from_secs(2);

/// One answered query.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct InfoEntry {
    /// Command without the `AT` prefix, e.g. `VR`.
    pub command: &'static str,
    /// Human-readable name.
    pub label: &'static str,
    /// Trimmed answer.
    pub value: String,
}

/// Answers to the standard info queries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareInfo {
    /// Rate command mode answered at.
    pub baud_rate: u32,
    /// Answers, in query order.
    pub entries: Vec<InfoEntry>,
}

impl FirmwareInfo {
    /// Value of `command`, if it was answered.
    pub fn get(&self, command: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.command == command)
            .map(|e| e.value.as_str())
    }
}

/// An open command-mode session. Leave with [`CommandModeSession::exit`].
pub struct CommandModeSession<'t, O: PortOpener> {
    transport: &'t mut Transport<O>,
    baud_rate: u32,
}

impl<'t, O: PortOpener> CommandModeSession<'t, O> {
    /// Enter command mode at `baud`. `None` if the escape is not acknowledged.
    pub fn enter(transport: &'t mut Transport<O>, baud: u32, gate_timeout: Duration) -> Result<Option<Self>> {
        transport.ensure_open(baud, gate_timeout)?;
        transport.discard_input()?;

        transport.clock().sleep(GUARD_INTERVAL);
        transport.send(MODE_ENTRY)?;
        transport.clock().sleep(GUARD_INTERVAL);

        let state = transport.collect(ENTRY_WINDOW, true)?.state();
        if state != DeviceState::CommandMode {
            debug!("No command mode at {baud} baud ({state})");
            return Ok(None);
        }

        info!("Entered command mode at {baud} baud");
        Ok(Some(Self {
            transport,
            baud_rate: baud,
        }))
    }

    /// Rate the session is talking at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Send `AT<command>\r` and return the trimmed answer line.
    pub fn query(&mut self, command: &str) -> Result<String> {
        self.transport.discard_input()?;
        self.transport.send(&at::encode(command))?;
        let response = self
            .transport
            .collect_until(QUERY_WINDOW, |r| r.as_bytes().contains(&b'\r'))?;
        let value = String::from_utf8_lossy(response.as_bytes()).trim().to_string();
        debug!("AT{command} -> {value:?}");
        Ok(value)
    }

    /// Run every standard info query.
    pub fn firmware_info(&mut self) -> Result<FirmwareInfo> {
        let mut entries = Vec::with_capacity(at::INFO_QUERIES.len());
        for &(command, label) in at::INFO_QUERIES {
            let value = self.query(command)?;
            entries.push(InfoEntry {
                command,
                label,
                value,
            });
        }
        Ok(FirmwareInfo {
            baud_rate: self.baud_rate,
            entries,
        })
    }

    /// Leave command mode.
    pub fn exit(self) -> Result<()> {
        self.transport.discard_input()?;
        self.transport.send(EXIT_COMMAND_MODE)?;
        self.transport
            .collect_until(QUERY_WINDOW, |r| r.as_bytes().contains(&b'\r'))?;
        debug!("Left command mode");
        Ok(())
    }
}

/// Try each of `bauds` until command mode answers, then read the info block.
pub fn read_firmware_info<O: PortOpener>(
    transport: &mut Transport<O>,
    bauds: &[u32],
    gate_timeout: Duration,
) -> Result<Option<FirmwareInfo>> {
    for &baud in bauds {
        if let Some(mut session) = CommandModeSession::enter(transport, baud, gate_timeout)? {
            let info = session.firmware_info()?;
            session.exit()?;
            return Ok(Some(info));
        }
    }
    Ok(None)
}
