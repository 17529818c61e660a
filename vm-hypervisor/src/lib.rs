//! Client for the Firecracker control-socket API.
//!
//! One [`HypervisorDriver`] talks to one hypervisor process through its
//! unix control socket. The wire calls go through a [`ControlTransport`],
//! so the lifecycle controller can be exercised without a real hypervisor.

pub mod driver;
pub mod error;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use driver::{
    BalloonConfig, BootPlan, HypervisorDriver, MachineConfig, DEFAULT_BOOT_ARGS,
    DEFAULT_STOP_GRACE, ROOT_DRIVE_ID, SOCKET_WAIT_TIMEOUT,
};
pub use error::{DriverError, Result};
pub use transport::{
    ControlMethod, ControlResponse, ControlTransport, UnixSocketTransport, DEFAULT_REQUEST_TIMEOUT,
};
