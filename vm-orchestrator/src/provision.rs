//! OS-level provisioning steps that run outside the process.
//!
//! TAP/NAT setup, boot image customization and hypervisor launch are
//! delegated to a [`Provisioner`]. The production implementation shells out
//! to scripts; tests substitute an in-memory one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vm_network::NetworkIdentity;

use crate::error::{OrchestratorError, Result};

/// Where VM artefacts live on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmLayout {
    pub root_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub log_dir: PathBuf,
    pub kernel_image_name: String,
}

impl Default for VmLayout {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/opt/firecracker/vm"),
            socket_dir: PathBuf::from("/tmp/firecracker-sockets"),
            log_dir: PathBuf::from("/opt/firecracker/logs"),
            kernel_image_name: "vmlinux-5.10.225".to_string(),
        }
    }
}

/// Concrete paths for one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmPaths {
    pub vm_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub pid_file_path: PathBuf,
    pub kernel_image_path: PathBuf,
    pub rootfs_path: PathBuf,
}

impl VmLayout {
    pub fn vm_dir(&self, user_id: i64, name: &str) -> PathBuf {
        self.root_dir.join(user_id.to_string()).join(name)
    }

    pub fn paths(&self, user_id: i64, name: &str, os_type: &str) -> VmPaths {
        let vm_dir = self.vm_dir(user_id, name);
        VmPaths {
            socket_path: self
                .socket_dir
                .join(format!("{}_{}.socket", user_id, name)),
            log_path: self
                .log_dir
                .join(format!("firecracker-{}_{}.log", user_id, name)),
            pid_file_path: vm_dir.join("firecracker.pid"),
            kernel_image_path: vm_dir.join(&self.kernel_image_name),
            rootfs_path: vm_dir.join(format!("{}.ext4", os_type)),
            vm_dir,
        }
    }
}

/// Everything a provisioning step needs to know about its VM.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub vm_id: i64,
    pub user_id: i64,
    pub name: String,
    pub os_type: String,
    pub disk_size_gb: i64,
    pub network: NetworkIdentity,
    pub namespace: String,
    pub paths: VmPaths,
}

#[derive(Debug, Clone)]
pub struct SshKeyMaterial {
    pub public_key: String,
    pub private_key: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Generate a fresh RSA key pair for a VM.
    async fn generate_ssh_key(&self, comment: &str) -> Result<SshKeyMaterial>;

    /// Create the TAP device and network namespace and apply NAT rules.
    async fn setup_network(&self, ctx: &ProvisionContext) -> Result<()>;

    /// Copy the base image for `os_type` and inject credentials.
    async fn prepare_image(
        &self,
        ctx: &ProvisionContext,
        public_key: &str,
        root_password: Option<&str>,
    ) -> Result<()>;

    /// Launch the hypervisor process listening on `ctx.paths.socket_path`.
    async fn launch_hypervisor(&self, ctx: &ProvisionContext) -> Result<()>;

    /// Kill the hypervisor and release its socket. Keeps disk and network.
    async fn teardown(&self, ctx: &ProvisionContext) -> Result<()>;

    /// Remove every OS-level resource of the VM.
    async fn destroy(&self, ctx: &ProvisionContext) -> Result<()>;
}

/// Runs the provisioning shell scripts from a directory.
#[derive(Debug, Clone)]
pub struct ScriptProvisioner {
    scripts_dir: PathBuf,
}

impl ScriptProvisioner {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    async fn run(&self, script: &str, args: Vec<String>) -> Result<()> {
        let program = self.scripts_dir.join(script);
        let step = script.to_string();
        let working_dir = self.scripts_dir.clone();

        let output = tokio::task::spawn_blocking(move || {
            vm_core::run_captured(&program, &args, Some(&working_dir))
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("{} task panicked: {}", step, e)))??;

        if output.success() {
            info!("{} completed", script);
            Ok(())
        } else {
            warn!("{} exited with {:?}", script, output.code);
            Err(OrchestratorError::external(
                script,
                format!("exit code {:?}\n{}", output.code, output.tail(50)),
            ))
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl Provisioner for ScriptProvisioner {
    async fn generate_ssh_key(&self, comment: &str) -> Result<SshKeyMaterial> {
        let dir = tempfile::tempdir()?;
        let key_path = dir.path().join("id_rsa");
        let args = vec![
            "-t".to_string(),
            "rsa".to_string(),
            "-b".to_string(),
            "4096".to_string(),
            "-N".to_string(),
            String::new(),
            "-q".to_string(),
            "-C".to_string(),
            comment.to_string(),
            "-f".to_string(),
            path_arg(&key_path),
        ];

        let output = tokio::task::spawn_blocking(move || {
            vm_core::run_captured(Path::new("ssh-keygen"), &args, None)
        })
        .await
        .map_err(|e| OrchestratorError::Internal(format!("ssh-keygen task panicked: {}", e)))??;

        if !output.success() {
            return Err(OrchestratorError::external("ssh-keygen", output.tail(20)));
        }

        let private_key = tokio::fs::read_to_string(&key_path).await?;
        let public_key = tokio::fs::read_to_string(key_path.with_extension("pub")).await?;

        Ok(SshKeyMaterial {
            public_key: public_key.trim().to_string(),
            private_key,
        })
    }

    async fn setup_network(&self, ctx: &ProvisionContext) -> Result<()> {
        self.run(
            "setup_network.sh",
            vec![
                ctx.user_id.to_string(),
                ctx.name.clone(),
                ctx.network.tap_device.clone(),
                ctx.network.tap_ip.to_string(),
                ctx.network.vm_ip.to_string(),
                ctx.network.mac.clone(),
                ctx.namespace.clone(),
            ],
        )
        .await
    }

    async fn prepare_image(
        &self,
        ctx: &ProvisionContext,
        public_key: &str,
        root_password: Option<&str>,
    ) -> Result<()> {
        let mut args = vec![
            ctx.os_type.clone(),
            ctx.user_id.to_string(),
            public_key.to_string(),
            ctx.disk_size_gb.to_string(),
            ctx.name.clone(),
        ];
        if let Some(password) = root_password {
            args.push(password.to_string());
        }

        self.run("prepare_vm_image.sh", args).await
    }

    async fn launch_hypervisor(&self, ctx: &ProvisionContext) -> Result<()> {
        self.run(
            "start_firecracker.sh",
            vec![
                ctx.user_id.to_string(),
                ctx.name.clone(),
                path_arg(&ctx.paths.socket_path),
                path_arg(&ctx.paths.log_path),
            ],
        )
        .await
    }

    async fn teardown(&self, ctx: &ProvisionContext) -> Result<()> {
        self.run(
            "stop_vm.sh",
            vec![
                ctx.user_id.to_string(),
                ctx.name.clone(),
                ctx.network.tap_device.clone(),
            ],
        )
        .await
    }

    async fn destroy(&self, ctx: &ProvisionContext) -> Result<()> {
        self.run(
            "delete_vm.sh",
            vec![
                ctx.user_id.to_string(),
                ctx.name.clone(),
                ctx.network.tap_device.clone(),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn context(layout: &VmLayout) -> ProvisionContext {
        ProvisionContext {
            vm_id: 3,
            user_id: 7,
            name: "web".to_string(),
            os_type: "ubuntu".to_string(),
            disk_size_gb: 5,
            network: vm_network::identity(3),
            namespace: "ns_web".to_string(),
            paths: layout.paths(7, "web", "ubuntu"),
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_layout_paths() {
        let layout = VmLayout::default();
        let paths = layout.paths(7, "web", "ubuntu");

        assert_eq!(paths.vm_dir, PathBuf::from("/opt/firecracker/vm/7/web"));
        assert_eq!(
            paths.socket_path,
            PathBuf::from("/tmp/firecracker-sockets/7_web.socket")
        );
        assert_eq!(
            paths.log_path,
            PathBuf::from("/opt/firecracker/logs/firecracker-7_web.log")
        );
        assert_eq!(
            paths.kernel_image_path,
            PathBuf::from("/opt/firecracker/vm/7/web/vmlinux-5.10.225")
        );
        assert_eq!(
            paths.rootfs_path,
            PathBuf::from("/opt/firecracker/vm/7/web/ubuntu.ext4")
        );
    }

    #[tokio::test]
    async fn test_script_receives_network_arguments() {
        let scripts = tempfile::tempdir().unwrap();
        let record = scripts.path().join("args.txt");
        write_script(
            scripts.path(),
            "setup_network.sh",
            &format!("echo \"$@\" > {}", record.display()),
        );

        let provisioner = ScriptProvisioner::new(scripts.path());
        provisioner
            .setup_network(&context(&VmLayout::default()))
            .await
            .expect("script should succeed");

        let args = std::fs::read_to_string(&record).unwrap();
        assert_eq!(
            args.trim(),
            "7 web tap3 172.16.0.13 172.16.0.14 06:00:AC:10:00:0e ns_web"
        );
    }

    #[tokio::test]
    async fn test_failing_script_keeps_output() {
        let scripts = tempfile::tempdir().unwrap();
        write_script(
            scripts.path(),
            "stop_vm.sh",
            "echo 'tap3: device busy' >&2; exit 2",
        );

        let provisioner = ScriptProvisioner::new(scripts.path());
        let err = provisioner
            .teardown(&context(&VmLayout::default()))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::ExternalProcess { step, output } => {
                assert_eq!(step, "stop_vm.sh");
                assert!(output.contains("device busy"));
                assert!(output.contains("Some(2)"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
