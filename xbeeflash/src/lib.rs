//! # xbeeflash
//!
//! Recover and reflash XBee radio modules over unreliable serial links.
//!
//! The radio may be running firmware at an unknown baud rate, parked in AT
//! command mode, already sitting in its Gecko bootloader, or silent. The
//! link may be a USB adapter or a serial port republished by a network
//! bridge that disappears every time the port is closed. This crate:
//!
//! - probes candidate baud rates and classifies what answers
//! - drives the radio into the bootloader with legal command sequences
//! - uploads an image over XMODEM (or raw chunks as a fallback)
//! - starts the new firmware and re-probes to confirm it runs
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `xmodem` (default): acknowledged XMODEM uploader
//! - `serde`: `Serialize` on probe, recovery and transfer reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use xbeeflash::{FirmwareFlasher, FirmwareImage, Recovery, RecoveryConfig, RecoveryOutcome};
//! use xbeeflash::clock::SystemClock;
//! use xbeeflash::connection::Transport;
//! use xbeeflash::port::NativeOpener;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("xbee3.gbl")?;
//!     let mut transport = Transport::new(NativeOpener, "/dev/ttyUSB0", SystemClock::shared());
//!
//!     let outcome = Recovery::new(RecoveryConfig::default()).run(&mut transport)?;
//!     if let RecoveryOutcome::Bootloader { baud, .. } = outcome {
//!         println!("bootloader at {baud} baud");
//!         let report = FirmwareFlasher::detect()?
//!             .transfer(&mut transport, &image, |p| println!("{}/{}", p.bytes_sent, p.total_bytes))
//!             .into_result()?;
//!         println!("firmware answers at {} baud", report.verification.baud_rate);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod clock;
pub mod connection;
pub mod device;
pub mod error;
pub mod flash;
pub mod port;
pub mod protocol;
pub mod recovery;

#[cfg(test)]
pub(crate) mod testutil;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker.
///
/// The checker should return `true` once the current operation should stop
/// (for example after Ctrl-C in a CLI). Recovery consults it between
/// attempts only. The first registration wins.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort};
#[cfg(feature = "native")]
pub use recovery::recover;
pub use {
    clock::{Clock, SharedClock, SystemClock},
    connection::{DetectedPort, GateStatus, Transport, UsbDevice},
    device::{DeviceState, ProbeEngine, ProbeResult, ProbeStep, Transition, classify},
    error::{AttemptFailure, Error, Result, TransferFailure},
    flash::{
        FirmwareFlasher, FirmwareImage, Reliability, TransferOutcome, TransferProgress,
        TransferReport, UploadMethod,
    },
    port::{Port, PortOpener, SerialConfig},
    recovery::{Recovery, RecoveryConfig, RecoveryOutcome, RecoverySession},
};
