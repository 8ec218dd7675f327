//! Transport gate: wait for a device path to (re)appear.
//!
//! A network bridge tears its virtual device down whenever the port is
//! closed and rebuilds it a moment later. After the path shows up again the
//! bridge is still reconnecting its remote side, so readiness is only
//! declared after a settle delay.

use std::time::Duration;

use log::{debug, warn};

use crate::clock::Clock;
use crate::port::PortOpener;

/// How often the path is polled.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Quiet period after the path appears, before it is used.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Default time to wait for the path.
pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of waiting on the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// The path exists and the settle delay has elapsed.
    Available,
    /// The path did not appear in time.
    TimedOut,
}

/// Poll `path` until it is present or `timeout` elapses.
///
/// Has no side effects beyond polling and sleeping, so it is safe to call
/// repeatedly.
pub fn await_available<O>(opener: &O, path: &str, timeout: Duration, clock: &dyn Clock) -> GateStatus
where
    O: PortOpener + ?Sized,
{
    let start = clock.now();
    let mut polls: u32 = 0;

    loop {
        polls += 1;
        if opener.is_present(path) {
            debug!("{path} present after {polls} poll(s), settling");
            clock.sleep(SETTLE_DELAY);
            return GateStatus::Available;
        }

        if clock.since(start) >= timeout {
            warn!("Timed out waiting for {path} after {timeout:?}");
            return GateStatus::TimedOut;
        }

        clock.sleep(POLL_INTERVAL);
    }
}
