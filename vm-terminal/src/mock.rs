//! Resolver and launcher stand-ins that need neither VMs nor ssh.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, TerminalError};
use crate::launcher::{AddressResolver, ShellLauncher};

/// Resolves only the VM ids it was given.
#[derive(Default)]
pub struct StaticResolver {
    addresses: Mutex<HashMap<String, String>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, vm_id: &str, address: &str) -> Self {
        if let Ok(mut addresses) = self.addresses.lock() {
            addresses.insert(vm_id.to_string(), address.to_string());
        }
        self
    }
}

#[async_trait]
impl AddressResolver for StaticResolver {
    async fn resolve(&self, vm_id: &str) -> Result<String> {
        self.addresses
            .lock()
            .ok()
            .and_then(|a| a.get(vm_id).cloned())
            .ok_or_else(|| TerminalError::VmUnavailable {
                vm_id: vm_id.to_string(),
                reason: "VM not found".to_string(),
            })
    }
}

/// Runs a fixed local program in place of ssh.
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    program: String,
    args: Vec<String>,
}

impl LocalLauncher {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// `sh -c script`
    pub fn shell(script: &str) -> Self {
        Self::new("sh", &["-c", script])
    }
}

impl ShellLauncher for LocalLauncher {
    fn command(&self, _address: &str, _username: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}
