//! VM lifecycle orchestration for the host agent
//!
//! This crate owns the persisted VM records and the state machine that
//! drives them: provisioning through external scripts, hypervisor
//! configuration through the control socket, and status reporting. It is
//! consumed by the vm-api HTTP service.

pub mod controller;
pub mod db;
pub mod error;
pub mod locks;
pub mod machine;
pub mod provision;
pub mod status;
pub mod store;

#[cfg(feature = "test-utils")]
pub mod mock;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use controller::{
    ControllerTiming, CreatedVm, StartedVm, VmLifecycleController, INTERRUPTED_MESSAGE,
};
pub use error::{OrchestratorError, Result};
pub use machine::{CreateVmRequest, VirtualMachine, VmStatus};
pub use provision::{Provisioner, ScriptProvisioner, VmLayout};
pub use status::{LiveStatus, VmMetrics};
pub use store::MachineStore;
