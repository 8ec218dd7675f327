//! Firmware transfer engine.
//!
//! Starting from an open bootloader prompt at the canonical baud rate:
//!
//! ```text
//!   \r -> menu (must show the bootloader)
//!   1  -> receiver ready
//!   upload (XMODEM, or raw chunks)
//!   settle 10s
//!   2  -> run new firmware
//!   wait, close, re-probe every verification baud
//! ```
//!
//! The re-probe is part of a successful transfer: an image that was sent but
//! does not come up as running firmware is reported as
//! [`TransferFailure::VerificationFailed`].

pub mod image;
pub mod upload;

use std::time::Duration;

use log::{debug, info, warn};

pub use image::FirmwareImage;
pub use upload::{Reliability, UploadMethod, Uploader, uploader_for};

use crate::connection::{DEFAULT_GATE_TIMEOUT, Transport};
use crate::device::{DeviceState, ModeController, ProbeEngine};
use crate::error::{Error, Result, TransferFailure};
use crate::port::PortOpener;
use crate::protocol::commands::{
    CANONICAL_BOOTLOADER_BAUD, DEFAULT_BAUD_RATES, EXIT_COMMAND_MODE, MENU_RUN, MENU_UPLOAD,
};

/// Time the bootloader needs to write and check the image.
pub const POST_TRANSFER_SETTLE: Duration = Duration::from_secs(10);

/// Wait after the run command before releasing the port.
pub const POST_RUN_WAIT: Duration = Duration::from_secs(5);

/// Wait between closing the port and the first verification probe.
pub const PRE_VERIFY_DELAY: Duration = Duration::from_secs(5);

/// Where a transfer has got to. Only used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferProgress {
    /// Bytes acknowledged (or written, for raw uploads).
    pub bytes_sent: usize,
    /// Image size.
    pub total_bytes: usize,
    /// 1-based index of the last acknowledged block (or written chunk).
    pub block_index: u32,
}

impl TransferProgress {
    pub(crate) fn start(total_bytes: usize) -> Self {
        Self {
            bytes_sent: 0,
            total_bytes,
            block_index: 0,
        }
    }

    /// Whether every byte has been sent.
    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total_bytes
    }
}

/// How the new firmware answered after the run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Verification {
    /// Rate the firmware answered at.
    pub baud_rate: u32,
    /// What the answer classified as.
    pub state: DeviceState,
    /// Set when the device answered without a command-mode acknowledgment.
    pub low_confidence: bool,
}

/// A completed, verified transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TransferReport {
    /// Upload method used.
    pub method: UploadMethod,
    /// Delivery guarantee of that method.
    pub reliability: Reliability,
    /// Final progress.
    pub progress: TransferProgress,
    /// Post-run check.
    pub verification: Verification,
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Image delivered and the new firmware answered.
    Transferred(TransferReport),
    /// The transfer stopped; the radio may still be in the bootloader.
    TransferFailed(TransferFailure),
}

impl TransferOutcome {
    /// Whether the transfer succeeded.
    pub fn is_transferred(&self) -> bool {
        matches!(self, Self::Transferred(_))
    }

    /// The report, or the failure as an [`Error`].
    pub fn into_result(self) -> Result<TransferReport> {
        match self {
            Self::Transferred(report) => Ok(report),
            Self::TransferFailed(failure) => Err(Error::Transfer(failure)),
        }
    }
}

/// Uploads an image into the bootloader and checks that it runs.
pub struct FirmwareFlasher {
    uploader: Box<dyn Uploader + Send + Sync>,
    verification_bauds: Vec<u32>,
    gate_timeout: Duration,
    controller: ModeController,
}

impl FirmwareFlasher {
    /// Flasher using `method`.
    pub fn new(method: UploadMethod) -> Result<Self> {
        Ok(Self::with_uploader(uploader_for(method)?))
    }

    /// Flasher using the best method in this build.
    pub fn detect() -> Result<Self> {
        Self::new(UploadMethod::detect())
    }

    /// Flasher around a custom uploader.
    pub fn with_uploader(uploader: Box<dyn Uploader + Send + Sync>) -> Self {
        Self {
            uploader,
            verification_bauds: DEFAULT_BAUD_RATES.to_vec(),
            gate_timeout: DEFAULT_GATE_TIMEOUT,
            controller: ModeController::new(),
        }
    }

    /// Baud rates tried, in order, when verifying the new firmware.
    #[must_use]
    pub fn with_verification_bauds(mut self, bauds: &[u32]) -> Self {
        self.verification_bauds = bauds.to_vec();
        self
    }

    /// Gate timeout for every reopen during transfer and verification.
    #[must_use]
    pub fn with_gate_timeout(mut self, timeout: Duration) -> Self {
        self.gate_timeout = timeout;
        self.controller = ModeController::new().with_gate_timeout(timeout);
        self
    }

    /// Upload method in use.
    pub fn method(&self) -> UploadMethod {
        self.uploader.method()
    }

    /// Upload `image`, run it and verify it.
    ///
    /// `progress` sees monotonically increasing values. Every failure,
    /// including I/O, is reported in the outcome.
    pub fn transfer<O, F>(&self, transport: &mut Transport<O>, image: &FirmwareImage, mut progress: F) -> TransferOutcome
    where
        O: PortOpener,
        F: FnMut(TransferProgress),
    {
        match self.try_transfer(transport, image, &mut progress) {
            Ok(report) => {
                info!(
                    "Transfer verified: {} bytes via {}, firmware answers at {} baud",
                    report.progress.bytes_sent, report.method, report.verification.baud_rate
                );
                TransferOutcome::Transferred(report)
            },
            Err(err) => {
                let failure = TransferFailure::from(err);
                warn!("Transfer failed: {failure}");
                TransferOutcome::TransferFailed(failure)
            },
        }
    }

    fn try_transfer<O: PortOpener>(
        &self,
        transport: &mut Transport<O>,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferReport> {
        transport.ensure_open(CANONICAL_BOOTLOADER_BAUD, self.gate_timeout)?;

        let observed = self.controller.request_prompt(transport)?;
        if observed != DeviceState::Bootloader {
            return Err(TransferFailure::NotInBootloader { observed }.into());
        }

        info!(
            "Uploading {} bytes ({} blocks) via {}",
            image.size_bytes(),
            image.block_count(),
            self.uploader.method()
        );
        transport.discard_input()?;
        transport.send(&[MENU_UPLOAD])?;

        let clock = transport.shared_clock();
        let port = transport.port_mut()?;
        let sent = self.uploader.upload(port, clock.as_ref(), image, progress)?;

        let settle = transport.collect(POST_TRANSFER_SETTLE, false)?;
        if !settle.is_empty() {
            debug!(
                "Bootloader after upload: {:?}",
                String::from_utf8_lossy(settle.as_bytes()).trim()
            );
        }

        info!("Starting new firmware");
        let verification = self.run_and_verify(transport)?;
        let method = self.uploader.method();
        Ok(TransferReport {
            method,
            reliability: method.reliability(),
            progress: sent,
            verification,
        })
    }

    /// Start the firmware already resident in flash, without uploading.
    ///
    /// The transport must reach the bootloader prompt at the canonical baud
    /// rate; anything else is [`TransferFailure::NotInBootloader`].
    pub fn launch<O: PortOpener>(&self, transport: &mut Transport<O>) -> Result<Verification> {
        transport.ensure_open(CANONICAL_BOOTLOADER_BAUD, self.gate_timeout)?;

        let observed = self.controller.request_prompt(transport)?;
        if observed != DeviceState::Bootloader {
            return Err(TransferFailure::NotInBootloader { observed }.into());
        }

        info!("Starting resident firmware");
        self.run_and_verify(transport)
    }

    fn run_and_verify<O: PortOpener>(&self, transport: &mut Transport<O>) -> Result<Verification> {
        transport.send(&[MENU_RUN])?;
        transport.clock().sleep(POST_RUN_WAIT);
        self.verify(transport)
    }

    /// Re-probe the device until it answers as running firmware.
    pub fn verify<O: PortOpener>(&self, transport: &mut Transport<O>) -> Result<Verification> {
        transport.close();
        transport.clock().sleep(PRE_VERIFY_DELAY);

        let probe = ProbeEngine::new().with_gate_timeout(self.gate_timeout);
        let mut observed = DeviceState::Unresponsive;

        for &baud in &self.verification_bauds {
            match transport.reopen(baud, self.gate_timeout) {
                Ok(()) => {},
                Err(Error::TransportUnavailable { .. }) => {
                    warn!("Transport missing while verifying at {baud} baud");
                    continue;
                },
                Err(err) => return Err(err),
            }

            let result = probe.probe(transport, baud)?;
            match result.state() {
                DeviceState::CommandMode => {
                    transport.send(EXIT_COMMAND_MODE)?;
                    transport.collect(Duration::from_secs(1), false)?;
                    return Ok(Verification {
                        baud_rate: baud,
                        state: DeviceState::CommandMode,
                        low_confidence: false,
                    });
                },
                DeviceState::UnknownAlive => {
                    warn!("Firmware answers at {baud} baud without acknowledging command mode");
                    return Ok(Verification {
                        baud_rate: baud,
                        state: DeviceState::UnknownAlive,
                        low_confidence: true,
                    });
                },
                DeviceState::Bootloader => {
                    observed = DeviceState::Bootloader;
                    break;
                },
                DeviceState::Unresponsive => {},
            }
        }

        transport.close();
        Err(TransferFailure::VerificationFailed { observed }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::xmodem::BLOCK_SIZE;
    use crate::testutil::{SimBus, init_logging, SimDevice, SimMode, SimOpener, VirtualClock};

    fn transport(bus: &SimBus, clock: &VirtualClock) -> Transport<SimOpener> {
        Transport::new(bus.opener(), "/tmp/ttyXBEE", clock.shared())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[cfg(feature = "xmodem")]
    #[test]
    fn test_ten_thousand_bytes_in_79_blocks() {
        init_logging();
        let clock = VirtualClock::new();
        let (bus, device) = SimBus::with_device(&clock, SimDevice::bootloader(9600));
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let data = pattern(10_000);
        let image = FirmwareImage::from_bytes(data.clone()).unwrap();

        let mut seen = Vec::new();
        let outcome = FirmwareFlasher::new(UploadMethod::Xmodem)
            .unwrap()
            .transfer(&mut transport, &image, |p| seen.push(p));

        let TransferOutcome::Transferred(report) = outcome else {
            panic!("expected transfer to succeed");
        };
        assert_eq!(report.progress.bytes_sent, 10_000);
        assert_eq!(report.progress.block_index, 79);
        assert_eq!(report.reliability, Reliability::Acknowledged);
        assert_eq!(report.verification.state, DeviceState::CommandMode);
        assert_eq!(report.verification.baud_rate, 9600);
        assert!(!report.verification.low_confidence);

        assert_eq!(seen.len(), 79);
        assert!(seen.windows(2).all(|w| w[0].bytes_sent <= w[1].bytes_sent
            && w[0].block_index < w[1].block_index));

        let device = device.lock().unwrap();
        assert_eq!(device.blocks, 79);
        assert_eq!(device.image.len(), 79 * BLOCK_SIZE);
        assert_eq!(&device.image[..10_000], &data[..]);
        assert!(device.image[10_000..].iter().all(|b| *b == 0));
        assert_eq!(device.runs, 1);
        assert_eq!(device.mode, SimMode::Firmware);
    }

    #[cfg(feature = "xmodem")]
    #[test]
    fn test_naks_are_absorbed() {
        let clock = VirtualClock::new();
        let mut sim = SimDevice::bootloader(9600);
        sim.nak_budget = 3;
        let (bus, device) = SimBus::with_device(&clock, sim);
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let image = FirmwareImage::from_bytes(pattern(300)).unwrap();

        let outcome = FirmwareFlasher::new(UploadMethod::Xmodem)
            .unwrap()
            .transfer(&mut transport, &image, |_| {});

        assert!(outcome.is_transferred());
        assert_eq!(device.lock().unwrap().blocks, 3);
    }

    #[cfg(feature = "xmodem")]
    #[test]
    fn test_retry_exhaustion_is_reported() {
        let clock = VirtualClock::new();
        let mut sim = SimDevice::bootloader(9600);
        sim.nak_budget = usize::MAX;
        let (bus, device) = SimBus::with_device(&clock, sim);
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let image = FirmwareImage::from_bytes(pattern(300)).unwrap();

        let outcome = FirmwareFlasher::new(UploadMethod::Xmodem)
            .unwrap()
            .transfer(&mut transport, &image, |_| {});

        assert_eq!(
            outcome,
            TransferOutcome::TransferFailed(TransferFailure::ProtocolRetryExhausted { block: 1 })
        );
        assert_eq!(device.lock().unwrap().runs, 0);
    }

    #[test]
    fn test_running_firmware_is_not_in_bootloader() {
        let clock = VirtualClock::new();
        let (bus, _) = SimBus::with_device(&clock, SimDevice::firmware(115200));
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let image = FirmwareImage::from_bytes(pattern(10)).unwrap();

        let outcome = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .transfer(&mut transport, &image, |_| {});

        assert_eq!(
            outcome,
            TransferOutcome::TransferFailed(TransferFailure::NotInBootloader {
                observed: DeviceState::Unresponsive
            })
        );
        assert!(bus.writes().iter().all(|w| w.bytes != [MENU_UPLOAD]));
    }

    #[test]
    fn test_raw_fallback_is_best_effort() {
        let clock = VirtualClock::new();
        let (bus, device) = SimBus::with_device(&clock, SimDevice::bootloader(9600));
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let data = pattern(3000);
        let image = FirmwareImage::from_bytes(data.clone()).unwrap();

        let outcome = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .transfer(&mut transport, &image, |_| {});

        let report = outcome.into_result().unwrap();
        assert_eq!(report.method, UploadMethod::RawChunks);
        assert_eq!(report.reliability, Reliability::BestEffort);
        assert_eq!(report.progress.bytes_sent, 3000);
        assert_eq!(report.progress.block_index, 3);
        assert_eq!(device.lock().unwrap().raw_bytes, data);
    }

    #[test]
    fn test_silent_after_run_fails_verification() {
        let clock = VirtualClock::new();
        // Firmware comes up at a rate outside the verification list.
        let (bus, _) = SimBus::with_device(&clock, SimDevice::bootloader(4800));
        let mut transport = transport(&bus, &clock);
        transport.open(CANONICAL_BOOTLOADER_BAUD).unwrap();
        let image = FirmwareImage::from_bytes(pattern(200)).unwrap();

        let outcome = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .with_verification_bauds(&[115200, 9600])
            .transfer(&mut transport, &image, |_| {});

        assert_eq!(
            outcome,
            TransferOutcome::TransferFailed(TransferFailure::VerificationFailed {
                observed: DeviceState::Unresponsive
            })
        );
        assert!(!transport.is_open());
    }

    #[test]
    fn test_verify_reopens_through_gate() {
        let clock = VirtualClock::new();
        let (bus, _) = SimBus::with_device(&clock, SimDevice::firmware(38400));
        let mut transport = transport(&bus, &clock);
        transport.open(115200).unwrap();

        let verification = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .with_verification_bauds(&[9600, 38400])
            .verify(&mut transport)
            .unwrap();

        assert_eq!(verification.baud_rate, 38400);
        assert_eq!(bus.opens(), vec![115200, 9600, 38400]);
        assert_eq!(bus.presence_polls(), 2);
    }

    #[test]
    fn test_launch_runs_resident_firmware() {
        let clock = VirtualClock::new();
        let (bus, device) = SimBus::with_device(&clock, SimDevice::bootloader(9600));
        let mut transport = transport(&bus, &clock);

        let verification = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .launch(&mut transport)
            .unwrap();

        assert_eq!(verification.state, DeviceState::CommandMode);
        assert_eq!(verification.baud_rate, 9600);
        assert!(bus.writes().iter().all(|w| w.bytes != [MENU_UPLOAD]));
        let device = device.lock().unwrap();
        assert_eq!(device.runs, 1);
        assert!(device.image.is_empty());
    }

    #[test]
    fn test_launch_requires_bootloader() {
        let clock = VirtualClock::new();
        let bus = SimBus::silent(&clock);
        let mut transport = transport(&bus, &clock);

        let err = FirmwareFlasher::new(UploadMethod::RawChunks)
            .unwrap()
            .launch(&mut transport)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transfer(TransferFailure::NotInBootloader {
                observed: DeviceState::Unresponsive
            })
        ));
        assert!(bus.writes().iter().all(|w| w.bytes != [MENU_RUN]));
    }
}
