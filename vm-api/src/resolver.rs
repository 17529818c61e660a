use async_trait::async_trait;
use vm_orchestrator::{OrchestratorError, VmLifecycleController, VmStatus};
use vm_terminal::{AddressResolver, TerminalError};

/// Resolves terminal targets from the VM records: the VM must exist, be
/// running and have a network identity.
#[derive(Clone)]
pub struct VmAddressResolver {
    controller: VmLifecycleController,
}

impl VmAddressResolver {
    pub fn new(controller: VmLifecycleController) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl AddressResolver for VmAddressResolver {
    async fn resolve(&self, vm_id: &str) -> vm_terminal::Result<String> {
        let unavailable = |reason: String| TerminalError::VmUnavailable {
            vm_id: vm_id.to_string(),
            reason,
        };

        let id: i64 = vm_id
            .parse()
            .map_err(|_| TerminalError::InvalidInput(format!("invalid VM id '{}'", vm_id)))?;

        let vm = match self.controller.get(id).await {
            Ok(vm) => vm,
            Err(OrchestratorError::NotFound(_)) => return Err(unavailable("VM not found".into())),
            Err(e) => return Err(unavailable(e.to_string())),
        };

        if vm.status != VmStatus::Running {
            return Err(unavailable(format!("VM is {}", vm.status.as_str())));
        }
        vm.vm_ip()
            .ok_or_else(|| unavailable("VM has no network address".into()))
    }
}
