//! Protocol implementations.

pub mod commands;
pub mod xmodem;

// Re-export common types
pub use commands::{ApiFrame, CANONICAL_BOOTLOADER_BAUD, DEFAULT_BAUD_RATES};
pub use xmodem::{BLOCK_SIZE, CheckMode, XmodemConfig, XmodemSender};
