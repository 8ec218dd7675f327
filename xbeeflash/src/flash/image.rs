//! Firmware image loading.
//!
//! The image is opaque: only its size matters to the uploaders.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::xmodem::block_count;

/// An immutable firmware image, cheap to clone across retried transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
    source: Option<PathBuf>,
}

impl FirmwareImage {
    /// Read a whole image file into memory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!("Loaded {} bytes from {}", bytes.len(), path.display());
        let mut image = Self::from_bytes(bytes)
            .map_err(|_| Error::InvalidImage(format!("{} is empty", path.display())))?;
        image.source = Some(path.to_path_buf());
        Ok(image)
    }

    /// Wrap an in-memory image.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        Ok(Self {
            bytes: bytes.into(),
            source: None,
        })
    }

    /// Raw image contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Number of 128-byte transfer blocks.
    pub fn block_count(&self) -> usize {
        block_count(self.bytes.len())
    }

    /// File the image was read from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
