//! Error types for xbeeflash.
//!
//! Component contracts return explicit outcome values (see
//! [`crate::recovery::RecoveryOutcome`] and [`crate::flash::TransferOutcome`]).
//! [`Error`] covers I/O faults and the conversion of a terminal outcome into
//! an error at the caller's boundary.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::device::DeviceState;

/// Result type for xbeeflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for xbeeflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An operation needed an open transport but none was open.
    #[error("Transport is not open")]
    PortClosed,

    /// The device path never appeared within the gate timeout.
    #[error("Transport {path} unavailable after {timeout:?}")]
    TransportUnavailable {
        /// Device path that was polled.
        path: String,
        /// How long the gate waited.
        timeout: Duration,
    },

    /// The firmware image could not be used.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unsupported operation on this build or platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Recovery ended without reaching the bootloader.
    #[error("Recovery failed: {0}")]
    Recovery(#[from] AttemptFailure),

    /// Firmware transfer did not complete.
    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferFailure),
}

/// Why a single recovery attempt (one baud rate) did not reach the bootloader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum AttemptFailure {
    /// The device path never appeared or could not be opened.
    #[error("transport unavailable")]
    TransportUnavailable,

    /// No probe produced a recognized response at this baud rate.
    #[error("no recognized response at {baud} baud")]
    ProbeInconclusive {
        /// Baud rate that was probed.
        baud: u32,
    },

    /// A legal command was sent but the device did not reach the bootloader.
    #[error("{from} did not transition to bootloader (observed {observed})")]
    ModeTransitionFailed {
        /// State the transition started from.
        from: DeviceState,
        /// State observed after the command.
        observed: DeviceState,
    },

    /// The device answers but in an unrecognized mode. Needs an operator.
    #[error("device alive at {baud} baud in an unrecognized mode")]
    UnresolvedAlive {
        /// Baud rate the device answered at.
        baud: u32,
    },

    /// I/O failure while talking to the device.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Stopped at an attempt boundary by the embedding application.
    #[error("cancelled")]
    Cancelled,
}

/// Why a firmware transfer did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TransferFailure {
    /// The device did not present the bootloader prompt.
    #[error("device not in bootloader (observed {observed})")]
    NotInBootloader {
        /// State observed instead.
        observed: DeviceState,
    },

    /// The receiver never requested the first block.
    #[error("receiver never signalled readiness")]
    NoReceiver,

    /// A block was NAKed or timed out too many times.
    #[error("retries exhausted at block {block}")]
    ProtocolRetryExhausted {
        /// 1-based block index, or the index after the last block for EOT.
        block: u32,
    },

    /// The receiver sent CAN.
    #[error("receiver cancelled at block {block}")]
    ReceiverCancelled {
        /// 1-based block index.
        block: u32,
    },

    /// The device did not come back as running firmware.
    #[error("device did not re-probe as running firmware (observed {observed})")]
    VerificationFailed {
        /// Last state observed while verifying.
        observed: DeviceState,
    },

    /// I/O failure while talking to the device.
    #[error("I/O failure: {0}")]
    Io(String),
}

impl From<Error> for TransferFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Transfer(failure) => failure,
            other => Self::Io(other.to_string()),
        }
    }
}

impl From<Error> for AttemptFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Recovery(failure) => failure,
            Error::TransportUnavailable { .. } => Self::TransportUnavailable,
            other => Self::Io(other.to_string()),
        }
    }
}
