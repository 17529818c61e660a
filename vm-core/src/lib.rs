//! Shared building blocks for the host agent and placement services.

pub mod command;
pub mod error;
pub mod tracing_init;

pub use command::{run_captured, CommandOutput};
pub use error::{Result, VmError};
