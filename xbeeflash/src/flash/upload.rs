//! Uploaders: the two ways an image reaches the bootloader.
//!
//! Both run after the upload entry has been selected from the bootloader
//! menu and leave the bootloader to finish on its own.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, trace};

use crate::clock::Clock;
use crate::connection::{READ_TIMEOUT, read_until};
use crate::error::{Error, Result};
use crate::flash::{FirmwareImage, TransferProgress};
use crate::port::Port;
#[cfg(feature = "xmodem")]
use crate::protocol::xmodem::{XmodemConfig, XmodemSender};

/// Wait after selecting upload when no handshake is expected.
pub const UPLOAD_SELECT_WAIT: Duration = Duration::from_secs(2);

/// Raw path chunk size.
pub const RAW_CHUNK_SIZE: usize = 1024;

/// Raw path pause between chunks.
pub const RAW_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// How the image is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UploadMethod {
    /// XMODEM blocks, acknowledged one by one.
    Xmodem,
    /// Unacknowledged chunked writes.
    RawChunks,
}

impl UploadMethod {
    /// Best method compiled into this build.
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(feature = "xmodem") {
            Self::Xmodem
        } else {
            Self::RawChunks
        }
    }

    /// Guarantee level of this method.
    pub fn reliability(self) -> Reliability {
        match self {
            Self::Xmodem => Reliability::Acknowledged,
            Self::RawChunks => Reliability::BestEffort,
        }
    }
}

impl fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xmodem => write!(f, "xmodem"),
            Self::RawChunks => write!(f, "raw"),
        }
    }
}

impl FromStr for UploadMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xmodem" => Ok(Self::Xmodem),
            "raw" | "raw_chunks" => Ok(Self::RawChunks),
            other => Err(Error::Config(format!("unknown transfer method '{other}'"))),
        }
    }
}

/// Delivery guarantee of a finished upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Reliability {
    /// Every block was acknowledged by the receiver.
    Acknowledged,
    /// Bytes were written without acknowledgment.
    BestEffort,
}

/// Sends an image to a bootloader that has been told to receive one.
pub trait Uploader {
    /// Which method this is.
    fn method(&self) -> UploadMethod;

    /// Send `image`, reporting progress after each block or chunk.
    fn upload(
        &self,
        port: &mut dyn Port,
        clock: &dyn Clock,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferProgress>;
}

/// XMODEM uploader.
#[cfg(feature = "xmodem")]
#[derive(Debug, Clone, Default)]
pub struct XmodemUploader {
    config: XmodemConfig,
}

#[cfg(feature = "xmodem")]
impl XmodemUploader {
    /// Uploader with the given protocol settings.
    pub fn new(config: XmodemConfig) -> Self {
        Self { config }
    }
}

#[cfg(feature = "xmodem")]
impl Uploader for XmodemUploader {
    fn method(&self) -> UploadMethod {
        UploadMethod::Xmodem
    }

    fn upload(
        &self,
        port: &mut dyn Port,
        clock: &dyn Clock,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferProgress> {
        let previous_timeout = port.timeout();
        port.set_timeout(self.config.char_timeout)?;

        let mut last = TransferProgress::start(image.size_bytes());
        let result = XmodemSender::with_config(&mut *port, clock, self.config.clone()).transfer(
            image.as_bytes(),
            |block_index, bytes_sent, total_bytes| {
                last = TransferProgress {
                    bytes_sent,
                    total_bytes,
                    block_index,
                };
                progress(last);
            },
        );

        port.set_timeout(previous_timeout)?;
        let blocks = result?;
        info!("XMODEM upload finished, {blocks} blocks acknowledged");
        Ok(last)
    }
}

/// Fallback uploader: fixed-size chunks, no acknowledgment.
#[derive(Debug, Clone)]
pub struct RawChunkUploader {
    chunk_size: usize,
    chunk_delay: Duration,
}

impl Default for RawChunkUploader {
    fn default() -> Self {
        Self {
            chunk_size: RAW_CHUNK_SIZE,
            chunk_delay: RAW_CHUNK_DELAY,
        }
    }
}

impl Uploader for RawChunkUploader {
    fn method(&self) -> UploadMethod {
        UploadMethod::RawChunks
    }

    fn upload(
        &self,
        port: &mut dyn Port,
        clock: &dyn Clock,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferProgress> {
        clock.sleep(UPLOAD_SELECT_WAIT);
        let ready = read_until(port, clock, READ_TIMEOUT, |_| false)?;
        if !ready.is_empty() {
            debug!(
                "Bootloader before raw upload: {:?}",
                String::from_utf8_lossy(ready.as_bytes())
            );
        }

        let total = image.size_bytes();
        let mut last = TransferProgress::start(total);

        for (index, chunk) in image.as_bytes().chunks(self.chunk_size).enumerate() {
            port.write_all_bytes(chunk)?;
            trace!("Raw chunk {} ({} bytes)", index + 1, chunk.len());

            last = TransferProgress {
                bytes_sent: (last.bytes_sent + chunk.len()).min(total),
                total_bytes: total,
                block_index: u32::try_from(index + 1).unwrap_or(u32::MAX),
            };
            progress(last);
            clock.sleep(self.chunk_delay);
        }

        info!("Raw upload finished, {total} bytes written without acknowledgment");
        Ok(last)
    }
}

/// Uploader implementing `method` in this build.
pub fn uploader_for(method: UploadMethod) -> Result<Box<dyn Uploader + Send + Sync>> {
    match method {
        #[cfg(feature = "xmodem")]
        UploadMethod::Xmodem => Ok(Box::new(XmodemUploader::default())),
        #[cfg(not(feature = "xmodem"))]
        UploadMethod::Xmodem => Err(Error::Unsupported(
            "built without the xmodem feature".into(),
        )),
        UploadMethod::RawChunks => Ok(Box::new(RawChunkUploader::default())),
    }
}
