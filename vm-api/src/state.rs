use std::sync::Arc;

use vm_orchestrator::VmLifecycleController;
use vm_replication::ReplicaStore;
use vm_terminal::{EventBuffer, ShellLauncher, TerminalManager};

use crate::resolver::VmAddressResolver;

#[derive(Clone)]
pub struct AppState {
    pub controller: VmLifecycleController,
    pub replicas: ReplicaStore,
    pub terminals: TerminalManager,
    /// Output of terminals opened over REST, waiting to be fetched.
    pub terminal_output: EventBuffer,
}

impl AppState {
    pub fn new(controller: VmLifecycleController, launcher: Arc<dyn ShellLauncher>) -> Self {
        let replicas = ReplicaStore::new(controller.store().pool().clone());
        let resolver = Arc::new(VmAddressResolver::new(controller.clone()));
        Self {
            terminals: TerminalManager::new(resolver, launcher),
            controller,
            replicas,
            terminal_output: EventBuffer::default(),
        }
    }
}
