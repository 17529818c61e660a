//! Interactive shells into VMs over pseudo-terminals.
//!
//! A [`TerminalManager`] opens one pty-backed shell per connect request and
//! streams its output to the requesting client as [`TerminalEvent`]s.
//! Callers are expected to have authorised the client already.

pub mod buffer;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod protocol;
pub mod pty;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use buffer::EventBuffer;
pub use error::{Result, TerminalError};
pub use launcher::{AddressResolver, ShellLauncher, SshLauncher};
pub use manager::{
    event_channel, EventReceiver, EventSender, TerminalInfo, TerminalManager,
    EVENT_CHANNEL_CAPACITY, READ_TIMEOUT,
};
pub use protocol::{ClientFrame, TerminalEvent};
