//! VM lifecycle state machine.
//!
//! The controller owns every status change of a VM record. Each operation
//! takes the VM's lock, checks the transition, runs the external steps and
//! persists the outcome. A failing external step moves the VM to `error`
//! with the captured diagnostic; partially created OS resources are left in
//! place for the operator.
//!
//! Mutating operations run on their own task. A caller that goes away
//! (client disconnect, request timeout) does not cut a sequence short, so
//! a record only stays in `creating`, `starting` or `stopping` if the agent
//! itself dies. [`VmLifecycleController::recover_interrupted`] settles those
//! at the next start-up.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn, Instrument};
use vm_hypervisor::{
    BalloonConfig, BootPlan, ControlTransport, HypervisorDriver, DEFAULT_BOOT_ARGS,
    DEFAULT_STOP_GRACE, SOCKET_WAIT_TIMEOUT,
};

use crate::error::{OrchestratorError, Result};
use crate::locks::VmLocks;
use crate::machine::{namespace_for, CreateVmRequest, UsageCounters, VirtualMachine, VmStatus};
use crate::provision::{ProvisionContext, Provisioner, VmLayout, VmPaths};
use crate::status::{
    directory_usage_bytes, process_alive, read_pid_file, sample_process, LiveStatus, VmMetrics,
};
use crate::store::{MachineStore, NewVm};

const DEFAULT_BALLOON_MIB: i64 = 512;

/// Diagnostic left on records found mid-operation at start-up.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by agent restart";

#[derive(Debug, Clone, Copy)]
pub struct ControllerTiming {
    pub stop_grace: Duration,
    pub socket_timeout: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
            socket_timeout: SOCKET_WAIT_TIMEOUT,
        }
    }
}

/// Outcome of a successful `create`. The private key is only ever
/// returned here.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedVm {
    pub vm: VirtualMachine,
    pub ssh_key_id: i64,
    pub private_key: String,
    pub ssh_command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedVm {
    pub vm: VirtualMachine,
    pub vm_ip: String,
    pub ssh_port: i64,
    pub ssh_command: String,
    pub already_running: bool,
}

#[derive(Clone)]
pub struct VmLifecycleController {
    store: MachineStore,
    provisioner: Arc<dyn Provisioner>,
    transport: Arc<dyn ControlTransport>,
    layout: VmLayout,
    timing: ControllerTiming,
    locks: VmLocks,
}

impl VmLifecycleController {
    pub fn new(
        store: MachineStore,
        provisioner: Arc<dyn Provisioner>,
        transport: Arc<dyn ControlTransport>,
        layout: VmLayout,
    ) -> Self {
        Self {
            store,
            provisioner,
            transport,
            layout,
            timing: ControllerTiming::default(),
            locks: VmLocks::new(),
        }
    }

    pub fn with_timing(mut self, timing: ControllerTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn store(&self) -> &MachineStore {
        &self.store
    }

    pub fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// Create, provision and boot a new VM.
    #[instrument(skip(self, req), fields(user_id = req.user_id, name = %req.name))]
    pub async fn create(&self, req: CreateVmRequest) -> Result<CreatedVm> {
        self.detached(move |controller| async move { controller.run_create(req).await })
            .await
    }

    /// Boot a VM. Already running is success.
    #[instrument(skip(self))]
    pub async fn start(&self, id: i64) -> Result<StartedVm> {
        self.detached(move |controller| async move { controller.run_start(id).await })
            .await
    }

    /// Gracefully stop a VM. Stopping a stopped VM does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: i64) -> Result<VirtualMachine> {
        self.detached(move |controller| async move { controller.run_stop(id).await })
            .await
    }

    /// Tear down OS resources and remove the record. Running VMs are refused.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        self.detached(move |controller| async move { controller.run_delete(id).await })
            .await
    }

    /// Move every record left mid-operation by a previous agent process to
    /// `error`, so it can be started again or deleted. Returns how many
    /// records were settled.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stranded = self
            .store
            .list_in_status(&[VmStatus::Creating, VmStatus::Starting, VmStatus::Stopping])
            .await?;

        for vm in &stranded {
            let _guard = self.locks.acquire(vm.id).await;
            warn!(vm_id = vm.id, "VM was {} when the agent stopped", vm.status);
            self.store
                .mark_error(vm.id, &format!("{} while {}", INTERRUPTED_MESSAGE, vm.status))
                .await?;
        }
        Ok(stranded.len())
    }

    /// Run `op` on its own task and wait for it. Dropping the returned
    /// future leaves the task running to completion.
    async fn detached<T, F, Fut>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(op(self.clone()).in_current_span())
            .await
            .map_err(|e| OrchestratorError::Internal(format!("VM operation task failed: {}", e)))?
    }

    async fn run_create(&self, req: CreateVmRequest) -> Result<CreatedVm> {
        req.validate()?;
        let name = req.name.trim().to_string();

        if self
            .store
            .find_by_owner_and_name(req.user_id, &name)
            .await?
            .is_some()
        {
            return Err(OrchestratorError::Conflict(format!(
                "VM '{}' already exists for user {}",
                name, req.user_id
            )));
        }

        let key = self
            .provisioner
            .generate_ssh_key(&format!("{}@{}", req.user_id, name))
            .await?;
        let ssh_key_id = self
            .store
            .insert_ssh_key(req.user_id, &name, &key.public_key, &key.private_key)
            .await?;

        let new_vm = NewVm {
            user_id: req.user_id,
            ssh_key_id,
            name: name.clone(),
            os_type: req.os_type.clone(),
            vcpu_count: req.cpu_count,
            memory_size_mib: req.memory_size_mib,
            disk_size_gb: req.disk_size_gb,
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
            balloon_size_mib: DEFAULT_BALLOON_MIB,
            balloon_deflate_on_oom: true,
            network_namespace: namespace_for(&name),
            system_image_id: req.system_image_id,
            vm_offer_id: req.vm_offer_id,
            service_cluster_id: req.service_cluster_id,
        };

        let id = match self.store.insert_vm(&new_vm).await {
            Ok(id) => id,
            Err(e) => {
                self.store.delete_ssh_key(ssh_key_id).await.ok();
                return Err(e);
            }
        };
        let _guard = self.locks.acquire(id).await;
        info!(vm_id = id, "VM record created");

        if let Err(e) = self
            .provision(id, &key.public_key, req.root_password.as_deref())
            .await
        {
            return Err(self.fail(id, e).await);
        }

        let vm = self.store.get(id).await?;
        info!(vm_id = id, "VM created and running");

        Ok(CreatedVm {
            ssh_command: vm.ssh_command(),
            vm,
            ssh_key_id,
            private_key: key.private_key,
        })
    }

    async fn provision(
        &self,
        id: i64,
        public_key: &str,
        root_password: Option<&str>,
    ) -> Result<()> {
        let vm_id = u64::try_from(id)
            .map_err(|_| OrchestratorError::Internal(format!("negative VM id {}", id)))?;
        if !vm_network::fits(vm_id) {
            return Err(OrchestratorError::ResourceExhausted(
                "network address space exhausted".to_string(),
            ));
        }

        let vm = self.store.get(id).await?;
        let network = vm_network::identity(vm_id);
        let paths = self.layout.paths(vm.user_id, &vm.name, &vm.os_type);
        self.store.assign_network(id, &network, &paths).await?;
        info!(vm_id = id, "Allocated {}", network);

        let vm = self.store.get(id).await?;
        let ctx = self.context(&vm)?;

        self.provisioner.setup_network(&ctx).await?;
        self.provisioner
            .prepare_image(&ctx, public_key, root_password)
            .await?;

        self.advance(id, vm.status, VmStatus::Created).await?;

        let vm = self.store.get(id).await?;
        self.boot(&vm).await
    }

    async fn run_start(&self, id: i64) -> Result<StartedVm> {
        let _guard = self.locks.acquire(id).await;
        let vm = self.store.get(id).await?;

        if vm.status == VmStatus::Running {
            info!(vm_id = id, "VM already running");
            return started(vm, true);
        }

        if !matches!(
            vm.status,
            VmStatus::Created | VmStatus::Stopped | VmStatus::Error
        ) {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} is {} and cannot be started",
                id, vm.status
            )));
        }
        if vm.network.is_none() {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} has no network identity; it was never provisioned",
                id
            )));
        }

        if let Err(e) = self.boot(&vm).await {
            return Err(self.fail(id, e).await);
        }

        let vm = self.store.get(id).await?;
        started(vm, false)
    }

    async fn run_stop(&self, id: i64) -> Result<VirtualMachine> {
        let _guard = self.locks.acquire(id).await;
        let vm = self.store.get(id).await?;

        if vm.status == VmStatus::Stopped {
            info!(vm_id = id, "VM already stopped");
            return Ok(vm);
        }

        if !matches!(vm.status, VmStatus::Running | VmStatus::Error) {
            return Err(OrchestratorError::InvalidState(format!(
                "VM {} is {}, not running",
                id, vm.status
            )));
        }

        // failed before anything was launched
        if vm.network.is_none() {
            self.store.mark_stopped(id).await?;
            return self.store.get(id).await;
        }

        let ctx = self.context(&vm)?;
        let previous = vm.status;
        self.advance(id, previous, VmStatus::Stopping).await?;

        let driver = self.driver(&ctx.paths.socket_path);
        if driver.socket_exists() {
            if let Err(e) = driver.stop().await {
                warn!(vm_id = id, "Graceful shutdown failed, tearing down: {}", e);
            }
        }

        if let Err(e) = self.provisioner.teardown(&ctx).await {
            error!(vm_id = id, "Teardown failed: {}", e);
            self.store.set_status(id, previous).await?;
            self.store.record_error(id, &e.to_string()).await?;
            return Err(e);
        }

        self.store.mark_stopped(id).await?;
        info!(vm_id = id, "VM stopped");
        self.store.get(id).await
    }

    async fn run_delete(&self, id: i64) -> Result<()> {
        let guard = self.locks.acquire(id).await;
        let vm = self.store.get(id).await?;

        vm.status.transition(VmStatus::Deleted)?;

        if vm.network.is_some() {
            let ctx = self.context(&vm)?;
            if let Err(e) = self.provisioner.destroy(&ctx).await {
                return Err(self.fail(id, e).await);
            }
        }

        self.store.delete_vm(id).await?;
        drop(guard);
        self.locks.forget(id);

        info!(vm_id = id, "VM deleted");
        Ok(())
    }

    /// Combine the record with what the filesystem and control socket say.
    pub async fn status(&self, id: i64) -> Result<LiveStatus> {
        let Some(vm) = self.store.find(id).await? else {
            return Ok(LiveStatus::NotFound {
                vm_id: id,
                reason: "no such VM".to_string(),
            });
        };

        if vm.status == VmStatus::Error {
            return Ok(LiveStatus::Error {
                vm_id: id,
                status: vm.status,
                message: vm.last_error_message.clone().unwrap_or_default(),
            });
        }

        let vm_dir = self.layout.vm_dir(vm.user_id, &vm.name);
        if !vm_dir.exists() {
            return Ok(LiveStatus::NotFound {
                vm_id: id,
                reason: format!("VM directory {} missing", vm_dir.display()),
            });
        }

        let Some(process) = &vm.process else {
            return Ok(LiveStatus::Live {
                vm_id: id,
                status: vm.status,
                pid: None,
                process_alive: false,
                machine_config: None,
            });
        };

        let pid = read_pid_file(&process.pid_file_path).or(process.pid);
        let alive = pid.map(process_alive).unwrap_or(false);

        if !process.socket_path.exists() {
            if vm.status.is_active() {
                return Ok(LiveStatus::NotFound {
                    vm_id: id,
                    reason: format!(
                        "control socket {} missing",
                        process.socket_path.display()
                    ),
                });
            }
            return Ok(LiveStatus::Live {
                vm_id: id,
                status: vm.status,
                pid,
                process_alive: alive,
                machine_config: None,
            });
        }

        match self
            .driver(&process.socket_path)
            .read_machine_config()
            .await
        {
            Ok(config) => Ok(LiveStatus::Live {
                vm_id: id,
                status: vm.status,
                pid,
                process_alive: alive,
                machine_config: Some(config),
            }),
            Err(e) => Ok(LiveStatus::Error {
                vm_id: id,
                status: vm.status,
                message: e.to_string(),
            }),
        }
    }

    /// Live machine configuration and process usage of a named VM.
    pub async fn metrics(&self, user_id: i64, name: &str) -> Result<VmMetrics> {
        let vm = self
            .store
            .find_by_owner_and_name(user_id, name)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("'{}' for user {}", name, user_id))
            })?;
        let _guard = self.locks.acquire(vm.id).await;

        let vm_dir = self.layout.vm_dir(vm.user_id, &vm.name);
        if !vm_dir.exists() {
            return Err(OrchestratorError::NotFound(format!(
                "VM directory {} missing",
                vm_dir.display()
            )));
        }

        let process = vm.process.as_ref().ok_or_else(|| {
            OrchestratorError::NotFound(format!("VM {} has no hypervisor process", vm.id))
        })?;
        if !process.socket_path.exists() {
            return Err(OrchestratorError::NotFound(format!(
                "control socket {} missing",
                process.socket_path.display()
            )));
        }
        let pid = read_pid_file(&process.pid_file_path)
            .or(process.pid)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "pid file {} missing",
                    process.pid_file_path.display()
                ))
            })?;

        let machine_config = self
            .driver(&process.socket_path)
            .read_machine_config()
            .await?;
        let (cpu_usage_percent, memory_usage_mib) = sample_process(pid).await;

        let usage = UsageCounters {
            cpu_usage_percent,
            memory_usage_mib,
            disk_usage_bytes: directory_usage_bytes(&vm_dir),
            network_rx_bytes: None,
            network_tx_bytes: None,
        };
        self.store.update_usage(vm.id, &usage).await?;

        Ok(VmMetrics {
            vm_id: vm.id,
            name: vm.name,
            status: vm.status,
            pid,
            machine_config,
            cpu_usage_percent: usage.cpu_usage_percent,
            memory_usage_mib: usage.memory_usage_mib,
            disk_usage_bytes: usage.disk_usage_bytes,
        })
    }

    pub async fn get(&self, id: i64) -> Result<VirtualMachine> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<VirtualMachine>> {
        self.store.list(None).await
    }

    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<VirtualMachine>> {
        self.store.list(Some(user_id)).await
    }

    async fn boot(&self, vm: &VirtualMachine) -> Result<()> {
        self.advance(vm.id, vm.status, VmStatus::Starting).await?;

        let ctx = self.context(vm)?;
        let driver = self.driver(&ctx.paths.socket_path);

        if !driver.socket_exists() {
            info!(vm_id = vm.id, "Launching hypervisor");
            self.provisioner.launch_hypervisor(&ctx).await?;
            driver.wait_for_socket(self.timing.socket_timeout).await?;
        }

        driver.configure(&boot_plan(vm, &ctx)?).await?;
        driver.start().await?;

        let pid = read_pid_file(&ctx.paths.pid_file_path);
        self.store.mark_running(vm.id, pid).await?;
        info!(vm_id = vm.id, ?pid, "VM running");

        Ok(())
    }

    async fn advance(&self, id: i64, from: VmStatus, to: VmStatus) -> Result<()> {
        from.transition(to)?;
        self.store.set_status(id, to).await
    }

    async fn fail(&self, id: i64, err: OrchestratorError) -> OrchestratorError {
        let message = err.to_string();
        error!(vm_id = id, "VM operation failed: {}", message);

        if let Err(e) = self.store.mark_error(id, &message).await {
            error!(vm_id = id, "Could not record failure: {}", e);
        }
        err
    }

    fn driver(&self, socket_path: &Path) -> HypervisorDriver {
        HypervisorDriver::new(self.transport.clone(), socket_path)
            .with_stop_grace(self.timing.stop_grace)
    }

    fn context(&self, vm: &VirtualMachine) -> Result<ProvisionContext> {
        let network = vm.network.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("VM {} has no network identity", vm.id))
        })?;

        let mut paths: VmPaths = self.layout.paths(vm.user_id, &vm.name, &vm.os_type);
        if let Some(process) = &vm.process {
            paths.socket_path = process.socket_path.clone();
            paths.log_path = process.log_path.clone();
            paths.pid_file_path = process.pid_file_path.clone();
        }
        if let Some(kernel) = &vm.kernel_image_path {
            paths.kernel_image_path = kernel.clone();
        }
        if let Some(rootfs) = &vm.rootfs_path {
            paths.rootfs_path = rootfs.clone();
        }

        Ok(ProvisionContext {
            vm_id: vm.id,
            user_id: vm.user_id,
            name: vm.name.clone(),
            os_type: vm.os_type.clone(),
            disk_size_gb: vm.disk_size_gb,
            namespace: vm
                .network_namespace
                .clone()
                .unwrap_or_else(|| namespace_for(&vm.name)),
            network,
            paths,
        })
    }
}

fn started(vm: VirtualMachine, already_running: bool) -> Result<StartedVm> {
    let vm_ip = vm.vm_ip().ok_or_else(|| {
        OrchestratorError::InvalidState(format!("VM {} has no network identity", vm.id))
    })?;

    Ok(StartedVm {
        ssh_command: crate::machine::ssh_command(&vm_ip, vm.ssh_port),
        ssh_port: vm.ssh_port,
        vm_ip,
        vm,
        already_running,
    })
}

fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| OrchestratorError::InvalidInput(format!("{} out of range: {}", field, value)))
}

fn boot_plan(vm: &VirtualMachine, ctx: &ProvisionContext) -> Result<BootPlan> {
    Ok(BootPlan {
        vcpu_count: to_u32(vm.vcpu_count, "vcpu_count")?,
        mem_size_mib: to_u32(vm.memory_size_mib, "memory_size_mib")?,
        smt: false,
        kernel_image_path: ctx.paths.kernel_image_path.clone(),
        boot_args: vm.boot_args.clone(),
        rootfs_path: ctx.paths.rootfs_path.clone(),
        rootfs_read_only: false,
        iface_id: ctx.network.tap_device.clone(),
        guest_mac: ctx.network.mac.clone(),
        host_dev_name: ctx.network.tap_device.clone(),
        balloon: BalloonConfig {
            amount_mib: to_u32(vm.balloon_size_mib, "balloon_size_mib")?,
            deflate_on_oom: vm.balloon_deflate_on_oom,
            ..BalloonConfig::default()
        },
    })
}
