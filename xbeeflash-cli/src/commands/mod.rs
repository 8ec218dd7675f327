//! Command implementations.
//!
//! Each subcommand group is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod ports;
pub(crate) mod probe;
pub(crate) mod recover;
