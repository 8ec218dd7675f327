//! Mode transitions towards the bootloader.
//!
//! ```text
//!   Unresponsive  -> (none)
//!   CommandMode   -> AT%P -> reopen -> Bootloader | Failed
//!   UnknownAlive  -> AT%P -> reopen -> Bootloader | Unresolved
//!   Bootloader    -> Bootloader
//! ```
//!
//! The bootloader only talks at the canonical baud rate. Whenever reaching
//! it means a different rate, the transport is closed, gated and reopened
//! before the prompt is requested.

use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::{DEFAULT_GATE_TIMEOUT, Transport};
use crate::device::{DeviceState, ProbeResult};
use crate::error::Result;
use crate::port::{Port, PortOpener};
use crate::protocol::commands::{BOOTLOADER_INVOKE, CANONICAL_BOOTLOADER_BAUD, PROMPT_REQUEST};

/// Read window after the bootloader-invoke command.
pub const INVOKE_WINDOW: Duration = Duration::from_secs(3);

/// Read window after requesting the bootloader prompt.
pub const PROMPT_WINDOW: Duration = Duration::from_secs(3);

/// Break length used for hardware bootloader entry.
pub const HARDWARE_BREAK: Duration = Duration::from_millis(250);

/// Result of driving a detected state towards the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The bootloader prompt was seen; the transport is open at `baud`.
    Bootloader {
        /// Rate the prompt answered at.
        baud: u32,
    },
    /// Nothing answered, so there is nothing legal to send.
    NoTransition,
    /// A legal command was sent but the bootloader was not reached.
    Failed {
        /// State the command was sent from.
        from: DeviceState,
        /// State seen afterwards.
        observed: DeviceState,
    },
    /// An unrecognized device did not reach the bootloader after the invoke command.
    Unresolved {
        /// State seen afterwards.
        observed: DeviceState,
    },
}

impl Transition {
    /// Whether the bootloader prompt was reached.
    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::Bootloader { .. })
    }
}

/// Drives the radio from a detected state into the bootloader.
#[derive(Debug, Clone)]
pub struct ModeController {
    canonical_baud: u32,
    gate_timeout: Duration,
}

impl Default for ModeController {
    fn default() -> Self {
        Self {
            canonical_baud: CANONICAL_BOOTLOADER_BAUD,
            gate_timeout: DEFAULT_GATE_TIMEOUT,
        }
    }
}

impl ModeController {
    /// Controller targeting the canonical bootloader baud rate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate timeout used for every reopen.
    #[must_use]
    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self
    }

    /// Baud rate the bootloader is reached at.
    pub fn canonical_baud(&self) -> u32 {
        self.canonical_baud
    }

    /// Issue the minimal command sequence for `probe`'s state.
    ///
    /// `transport` must still be open at the probed baud rate.
    pub fn drive<O: PortOpener>(&self, transport: &mut Transport<O>, probe: &ProbeResult) -> Result<Transition> {
        match probe.state() {
            DeviceState::Unresponsive => Ok(Transition::NoTransition),
            DeviceState::Bootloader => {
                if probe.baud_rate() == self.canonical_baud {
                    Ok(Transition::Bootloader {
                        baud: self.canonical_baud,
                    })
                } else {
                    info!(
                        "Bootloader answered at {} baud, moving to {}",
                        probe.baud_rate(),
                        self.canonical_baud
                    );
                    self.confirm_at_canonical(transport, DeviceState::Bootloader)
                }
            },
            from @ (DeviceState::CommandMode | DeviceState::UnknownAlive) => self.invoke(transport, from),
        }
    }

    fn invoke<O: PortOpener>(&self, transport: &mut Transport<O>, from: DeviceState) -> Result<Transition> {
        info!("Requesting bootloader from {from}");
        transport.discard_input()?;
        transport.send(BOOTLOADER_INVOKE)?;
        let observed = transport.collect(INVOKE_WINDOW, true)?.state();

        // The radio reboots into the bootloader at the canonical rate, so
        // silence or noise here is not a refusal. Only command mode is.
        if observed == DeviceState::CommandMode {
            warn!("Invoke from {from} left the device in command mode");
            return Ok(Self::refused(from, observed));
        }
        debug!("Invoke from {from} answered {observed}, checking canonical rate");

        match self.confirm_at_canonical(transport, from)? {
            Transition::Failed { observed, .. } => Ok(Self::refused(from, observed)),
            transition => Ok(transition),
        }
    }

    fn refused(from: DeviceState, observed: DeviceState) -> Transition {
        match from {
            DeviceState::UnknownAlive => Transition::Unresolved { observed },
            _ => Transition::Failed { from, observed },
        }
    }

    /// Ask the bootloader to print its menu and classify the answer.
    pub fn request_prompt<O: PortOpener>(&self, transport: &mut Transport<O>) -> Result<DeviceState> {
        transport.discard_input()?;
        transport.send(PROMPT_REQUEST)?;
        Ok(transport.collect(PROMPT_WINDOW, true)?.state())
    }

    /// Force the bootloader through the control lines.
    ///
    /// Holds DTR low and RTS high while sending a break, which the radio
    /// samples at reset. Destructive: callers must have explicit operator
    /// consent, this is never part of automatic recovery.
    pub fn force_hardware_entry<O: PortOpener>(
        &self,
        transport: &mut Transport<O>,
        last_state: DeviceState,
    ) -> Result<Transition> {
        warn!("Forcing bootloader entry via DTR/RTS/break on {}", transport.path());

        if !transport.is_open() {
            transport.open(self.canonical_baud)?;
        }

        let port = transport.port_mut()?;
        port.set_dtr(false)?;
        port.set_rts(true)?;
        port.send_break(HARDWARE_BREAK)?;
        port.set_rts(false)?;
        port.set_dtr(true)?;
        debug!("Control-line sequence sent");

        self.confirm_at_canonical(transport, last_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ProbeEngine;
    use crate::testutil::{SimBus, SimDevice, SimMode, SimOpener, VirtualClock};

    fn transport(bus: &SimBus, clock: &VirtualClock) -> Transport<SimOpener> {
        Transport::new(bus.opener(), "/tmp/ttyXBEE", clock.shared())
    }

    fn result(state: DeviceState, baud: u32) -> ProbeResult {
        ProbeResult::new(state, baud, Vec::new(), Duration::ZERO, None)
    }

    #[test]
    fn test_unresponsive_has_no_transition() {
        let clock = VirtualClock::new();
        let bus = SimBus::silent(&clock);
        let mut transport = transport(&bus, &clock);
        transport.open(9600).unwrap();

        let transition = ModeController::new()
            .drive(&mut transport, &result(DeviceState::Unresponsive, 9600))
            .unwrap();

        assert_eq!(transition, Transition::NoTransition);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn test_bootloader_at_canonical_is_noop() {
        let clock = VirtualClock::new();
        let bus = SimBus::silent(&clock);
        let mut transport = transport(&bus, &clock);
        transport.open(115200).unwrap();

        let transition = ModeController::new()
            .drive(&mut transport, &result(DeviceState::Bootloader, 115200))
            .unwrap();

        assert_eq!(transition, Transition::Bootloader { baud: 115200 });
        assert_eq!(bus.opens(), vec![115200]);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn test_command_mode_reaches_bootloader_after_reopen() {
        let clock = VirtualClock::new();
        let (bus, device) = SimBus::with_device(&clock, SimDevice::firmware(9600));
        let mut transport = transport(&bus, &clock);

        let probe = ProbeEngine::new().probe(&mut transport, 9600).unwrap();
        assert_eq!(probe.state(), DeviceState::CommandMode);

        let transition = ModeController::new().drive(&mut transport, &probe).unwrap();

        assert_eq!(transition, Transition::Bootloader { baud: 115200 });
        assert_eq!(device.lock().unwrap().mode, SimMode::Bootloader);
        assert_eq!(bus.opens(), vec![9600, 115200]);
        assert_eq!(transport.baud_rate(), Some(115200));

        // Nothing after the invoke command may go out at the old rate.
        let writes = bus.writes();
        let invoke = writes
            .iter()
            .position(|w| w.bytes == BOOTLOADER_INVOKE)
            .unwrap();
        assert_eq!(writes[invoke].baud, 9600);
        assert!(writes[invoke + 1..].iter().all(|w| w.baud == 115200));
        assert_eq!(writes[invoke + 1].bytes, PROMPT_REQUEST);
        assert!(bus.presence_polls() >= 1);
    }

    #[test]
    fn test_silent_reboot_is_found_at_canonical_baud() {
        let clock = VirtualClock::new();
        let mut sim = SimDevice::firmware(9600);
        sim.quiet_reboot = true;
        let (bus, device) = SimBus::with_device(&clock, sim);
        let mut transport = transport(&bus, &clock);

        let probe = ProbeEngine::new().probe(&mut transport, 9600).unwrap();
        assert_eq!(probe.state(), DeviceState::CommandMode);

        let transition = ModeController::new().drive(&mut transport, &probe).unwrap();

        assert_eq!(transition, Transition::Bootloader { baud: 115200 });
        assert_eq!(device.lock().unwrap().mode, SimMode::Bootloader);
        assert_eq!(bus.opens(), vec![9600, 115200]);
    }

    #[test]
    fn test_command_mode_refusing_invoke_fails_after_canonical_check() {
        let clock = VirtualClock::new();
        let mut sim = SimDevice::firmware(9600);
        sim.accepts_invoke = false;
        let (bus, _) = SimBus::with_device(&clock, sim);
        let mut transport = transport(&bus, &clock);

        let probe = ProbeEngine::new().probe(&mut transport, 9600).unwrap();
        let transition = ModeController::new().drive(&mut transport, &probe).unwrap();

        assert_eq!(
            transition,
            Transition::Failed {
                from: DeviceState::CommandMode,
                observed: DeviceState::Unresponsive,
            }
        );
        assert_eq!(bus.opens(), vec![9600, 115200]);
        let last = bus.writes().pop().unwrap();
        assert_eq!((last.baud, last.bytes), (115200, PROMPT_REQUEST.to_vec()));
    }

    #[test]
    fn test_still_in_command_mode_fails_without_reopen() {
        let clock = VirtualClock::new();
        let bus = SimBus::new(&clock, Box::new(|_, _, _| b"OK\r".to_vec()));
        let mut transport = transport(&bus, &clock);
        transport.open(9600).unwrap();

        let transition = ModeController::new()
            .drive(&mut transport, &result(DeviceState::CommandMode, 9600))
            .unwrap();

        assert_eq!(
            transition,
            Transition::Failed {
                from: DeviceState::CommandMode,
                observed: DeviceState::CommandMode,
            }
        );
        assert_eq!(bus.opens(), vec![9600]);
    }

    #[test]
    fn test_unknown_alive_without_bootloader_is_unresolved() {
        let clock = VirtualClock::new();
        let bus = SimBus::new(&clock, Box::new(|_, _, _| b"ERROR\r".to_vec()));
        let mut transport = transport(&bus, &clock);
        transport.open(9600).unwrap();

        let transition = ModeController::new()
            .drive(&mut transport, &result(DeviceState::UnknownAlive, 9600))
            .unwrap();

        assert_eq!(
            transition,
            Transition::Unresolved {
                observed: DeviceState::UnknownAlive
            }
        );
        assert_eq!(bus.opens(), vec![9600, 115200]);
        assert!(bus.signals().is_empty());
    }

    #[test]
    fn test_bootloader_at_other_baud_moves_to_canonical() {
        let clock = VirtualClock::new();
        let bus = SimBus::new(
            &clock,
            Box::new(|baud, bytes, _| {
                if baud == 115200 && bytes == b"\r" {
                    b"BL > ".to_vec()
                } else {
                    Vec::new()
                }
            }),
        );
        let mut transport = transport(&bus, &clock);
        transport.open(57600).unwrap();

        let transition = ModeController::new()
            .drive(&mut transport, &result(DeviceState::Bootloader, 57600))
            .unwrap();

        assert_eq!(transition, Transition::Bootloader { baud: 115200 });
        assert_eq!(bus.opens(), vec![57600, 115200]);
    }

    #[test]
    fn test_reopen_timeout_surfaces_as_error() {
        let clock = VirtualClock::new();
        let (bus, _) = SimBus::with_device(&clock, SimDevice::firmware(9600));
        let mut transport = transport(&bus, &clock);
        let probe = ProbeEngine::new().probe(&mut transport, 9600).unwrap();

        // The bridge never comes back once the port is released.
        let controller = ModeController::new().with_gate_timeout(Duration::from_secs(2));
        bus.set_present(false);

        let err = controller.drive(&mut transport, &probe).unwrap_err();
        assert!(matches!(err, crate::Error::TransportUnavailable { .. }));
    }

    #[test]
    fn test_hardware_entry_sequence() {
        let clock = VirtualClock::new();
        let (bus, device) = SimBus::with_device(&clock, SimDevice::bootloader(9600));
        let mut transport = transport(&bus, &clock);

        let transition = ModeController::new()
            .force_hardware_entry(&mut transport, DeviceState::Unresponsive)
            .unwrap();

        assert_eq!(transition, Transition::Bootloader { baud: 115200 });
        assert_eq!(
            bus.signals(),
            vec!["dtr=false", "rts=true", "break", "rts=false", "dtr=true"]
        );
        assert_eq!(bus.opens(), vec![115200, 115200]);
        assert_eq!(device.lock().unwrap().mode, SimMode::Bootloader);
    }
}
