//! Integration tests for the VM lifecycle controller
//!
//! Drives create/start/stop/delete/status against an in-memory database, a
//! recording control transport and a provisioner that fakes the scripts on
//! a temporary directory.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vm_hypervisor::mock::MockTransport;
use vm_orchestrator::mock::{MockProvisioner, MockStep};
use vm_orchestrator::test_utils::create_test_db;
use vm_orchestrator::{
    ControllerTiming, CreateVmRequest, LiveStatus, MachineStore, OrchestratorError,
    VirtualMachine, VmLayout, VmLifecycleController, VmStatus, INTERRUPTED_MESSAGE,
};

struct Harness {
    controller: VmLifecycleController,
    provisioner: Arc<MockProvisioner>,
    transport: Arc<MockTransport>,
    dir: TempDir,
}

async fn harness() -> Harness {
    let pool = create_test_db().await;
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let layout = VmLayout {
        root_dir: dir.path().join("vm"),
        socket_dir: dir.path().join("sockets"),
        log_dir: dir.path().join("logs"),
        kernel_image_name: "vmlinux-5.10.225".to_string(),
    };

    let provisioner = Arc::new(MockProvisioner::new());
    let transport = Arc::new(MockTransport::new());
    let controller = VmLifecycleController::new(
        MachineStore::new(pool),
        provisioner.clone(),
        transport.clone(),
        layout,
    )
    .with_timing(ControllerTiming {
        stop_grace: Duration::ZERO,
        socket_timeout: Duration::from_secs(2),
    });

    Harness {
        controller,
        provisioner,
        transport,
        dir,
    }
}

fn request(name: &str, user_id: i64) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        user_id,
        os_type: "ubuntu".to_string(),
        cpu_count: 2,
        memory_size_mib: 2048,
        disk_size_gb: 5,
        service_cluster_id: Some(1),
        vm_offer_id: Some(10),
        system_image_id: Some(20),
        root_password: None,
    }
}

#[tokio::test]
async fn test_create_provisions_and_boots() {
    let h = harness().await;

    let created = h
        .controller
        .create(request("web", 7))
        .await
        .expect("Failed to create VM");

    let vm = &created.vm;
    assert_eq!(vm.status, VmStatus::Running);
    assert!(created.private_key.contains("PRIVATE KEY"));
    assert_eq!(vm.ssh_key_id, Some(created.ssh_key_id));

    let network = vm.network.as_ref().expect("network identity assigned");
    let expected = vm_network::identity(vm.id as u64);
    assert_eq!(network, &expected);
    assert_eq!(vm.network_namespace.as_deref(), Some("ns_web"));
    assert!(vm.last_start_time.is_some());
    assert_eq!(
        vm.process.as_ref().and_then(|p| p.pid),
        Some(std::process::id() as i64)
    );

    assert_eq!(
        h.provisioner.steps(),
        vec![
            MockStep::GenerateKey,
            MockStep::SetupNetwork,
            MockStep::PrepareImage,
            MockStep::Launch,
        ]
    );

    let paths: Vec<String> = h.transport.calls().into_iter().map(|c| c.path).collect();
    assert_eq!(
        paths,
        vec![
            "/machine-config".to_string(),
            "/boot-source".to_string(),
            "/drives/rootfs".to_string(),
            format!("/network-interfaces/{}", network.tap_device),
            "/balloon".to_string(),
            "/actions".to_string(),
        ]
    );
    assert_eq!(h.transport.actions(), vec!["InstanceStart"]);

    let key = h
        .controller
        .store()
        .get_ssh_key(created.ssh_key_id)
        .await
        .expect("key persisted");
    assert!(key.public_key.starts_with("ssh-rsa"));
}

#[tokio::test]
async fn test_duplicate_owner_and_name_is_rejected() {
    let h = harness().await;
    h.controller.create(request("web", 7)).await.unwrap();

    let err = h.controller.create(request("web", 7)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    // same name for another owner is fine
    h.controller.create(request("web", 8)).await.unwrap();
}

#[tokio::test]
async fn test_invalid_request_has_no_side_effects() {
    let h = harness().await;
    let mut req = request("web", 7);
    req.cpu_count = 0;

    let err = h.controller.create(req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    assert!(h.provisioner.steps().is_empty());
    assert!(h.controller.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failure_before_running_leaves_error_with_diagnostic() {
    let h = harness().await;
    h.provisioner
        .fail_at(MockStep::PrepareImage, "qemu-img: No space left on device");

    let err = h.controller.create(request("web", 7)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ExternalProcess { .. }));

    let vms = h.controller.list().await.unwrap();
    assert_eq!(vms.len(), 1);
    let vm = &vms[0];
    assert_eq!(vm.status, VmStatus::Error);
    let message = vm.last_error_message.as_deref().unwrap_or_default();
    assert!(message.contains("No space left on device"), "{}", message);
    assert!(vm.last_error_time.is_some());

    // no rollback of the network that was already set up
    assert!(vm.network.is_some());
    assert!(!h.provisioner.steps().contains(&MockStep::Destroy));
}

#[tokio::test]
async fn test_hypervisor_rejection_aborts_and_marks_error() {
    let h = harness().await;
    h.transport
        .fail_on("/balloon", 400, r#"{"fault_message":"balloon device busy"}"#);

    h.controller.create(request("web", 7)).await.unwrap_err();

    let vm = &h.controller.list().await.unwrap()[0];
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm
        .last_error_message
        .as_deref()
        .unwrap_or_default()
        .contains("balloon device busy"));
    assert!(h.transport.actions().is_empty(), "start must not be issued");
}

#[tokio::test]
async fn test_start_when_running_is_a_no_op() {
    let h = harness().await;
    let created = h.controller.create(request("web", 7)).await.unwrap();
    let calls_before = h.transport.calls().len();

    let started = h.controller.start(created.vm.id).await.unwrap();

    assert!(started.already_running);
    assert_eq!(started.vm_ip, created.vm.vm_ip().unwrap());
    assert_eq!(started.ssh_port, 22);
    assert_eq!(h.transport.calls().len(), calls_before);
}

#[tokio::test]
async fn test_stop_twice_is_idempotent() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;

    let first = h.controller.stop(id).await.expect("first stop");
    assert_eq!(first.status, VmStatus::Stopped);
    assert!(first.last_stop_time.is_some());
    assert_eq!(
        h.transport.actions(),
        vec!["InstanceStart", "SendCtrlAltDel", "InstanceHalt"]
    );
    assert_eq!(h.provisioner.count(MockStep::Teardown), 1);

    let second = h.controller.stop(id).await.expect("second stop");
    assert_eq!(second.status, VmStatus::Stopped);
    assert_eq!(h.transport.actions().len(), 3);
    assert_eq!(h.provisioner.count(MockStep::Teardown), 1);
}

#[tokio::test]
async fn test_failed_teardown_keeps_status() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;
    h.provisioner
        .fail_at(MockStep::Teardown, "Cannot find device \"tap1\"");

    let err = h.controller.stop(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ExternalProcess { .. }));

    let vm = h.controller.get(id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm
        .last_error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Cannot find device"));
}

#[tokio::test]
async fn test_restart_relaunches_and_replays_configuration() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;
    tokio_test::assert_ok!(h.controller.stop(id).await);

    let started = h.controller.start(id).await.expect("restart");

    assert!(!started.already_running);
    assert_eq!(started.vm.status, VmStatus::Running);
    assert_eq!(h.provisioner.count(MockStep::Launch), 2);

    let machine_configs = h
        .transport
        .calls()
        .into_iter()
        .filter(|c| c.path == "/machine-config")
        .count();
    assert_eq!(machine_configs, 2);
}

#[tokio::test]
async fn test_start_recovers_from_error() {
    let h = harness().await;
    h.provisioner.fail_at(MockStep::Launch, "firecracker: permission denied");
    let err = h.controller.create(request("web", 7)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ExternalProcess { .. }));

    let id = h.controller.list().await.unwrap()[0].id;
    assert_eq!(h.controller.get(id).await.unwrap().status, VmStatus::Error);

    h.provisioner.clear_failure();
    let started = h.controller.start(id).await.expect("start after fix");
    assert_eq!(started.vm.status, VmStatus::Running);
}

#[tokio::test]
async fn test_delete_refuses_running_vm() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;

    let err = h.controller.delete(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState(_)));
    assert_eq!(h.controller.get(id).await.unwrap().status, VmStatus::Running);
}

#[tokio::test]
async fn test_delete_removes_record_key_and_files() {
    let h = harness().await;
    let created = h.controller.create(request("web", 7)).await.unwrap();
    let id = created.vm.id;
    h.controller.stop(id).await.unwrap();

    h.controller.delete(id).await.expect("delete stopped VM");

    assert!(matches!(
        h.controller.get(id).await,
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(h
        .controller
        .store()
        .get_ssh_key(created.ssh_key_id)
        .await
        .is_err());
    assert!(!h.dir.path().join("vm").join("7").join("web").exists());

    let err = h.controller.delete(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_status_reports_live_machine_config() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;

    match h.controller.status(id).await.unwrap() {
        LiveStatus::Live {
            status,
            process_alive,
            machine_config,
            ..
        } => {
            assert_eq!(status, VmStatus::Running);
            assert!(process_alive);
            let config = machine_config.expect("machine config read from socket");
            assert_eq!(config.vcpu_count, 2);
            assert_eq!(config.mem_size_mib, 2048);
        }
        other => panic!("expected live status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_status_not_found_when_files_missing() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;

    assert!(h.controller.status(9999).await.unwrap().is_not_found());

    std::fs::remove_dir_all(h.dir.path().join("vm").join("7").join("web")).unwrap();
    assert!(h.controller.status(id).await.unwrap().is_not_found());
}

#[tokio::test]
async fn test_status_surfaces_error_message() {
    let h = harness().await;
    h.provisioner.fail_at(MockStep::SetupNetwork, "RTNETLINK answers: File exists");
    h.controller.create(request("web", 7)).await.unwrap_err();
    let id = h.controller.list().await.unwrap()[0].id;

    match h.controller.status(id).await.unwrap() {
        LiveStatus::Error { message, .. } => assert!(message.contains("RTNETLINK")),
        other => panic!("expected error status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_metrics_for_running_vm() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;

    let metrics = h.controller.metrics(7, "web").await.expect("metrics");

    assert_eq!(metrics.vm_id, id);
    assert_eq!(metrics.pid, std::process::id() as i64);
    assert_eq!(metrics.machine_config.vcpu_count, 2);
    assert!(metrics.memory_usage_mib.is_some());

    let vm = h.controller.get(id).await.unwrap();
    assert!(vm.usage.memory_usage_mib.is_some());
    assert!(vm.usage.disk_usage_bytes.unwrap_or_default() > 0);
}

#[tokio::test]
async fn test_metrics_not_found_after_stop() {
    let h = harness().await;
    let id = h.controller.create(request("web", 7)).await.unwrap().vm.id;
    h.controller.stop(id).await.unwrap();

    let err = h.controller.metrics(7, "web").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));

    let err = h.controller.metrics(7, "missing").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_list_by_user() {
    let h = harness().await;
    h.controller.create(request("a", 1)).await.unwrap();
    h.controller.create(request("b", 1)).await.unwrap();
    h.controller.create(request("c", 2)).await.unwrap();

    assert_eq!(h.controller.list().await.unwrap().len(), 3);

    let mine = h.controller.list_by_user(1).await.unwrap();
    assert_eq!(mine.len(), 2);
    assert!(mine.iter().all(|vm| vm.user_id == 1));
}

#[tokio::test]
async fn test_id_beyond_address_space_is_rejected() {
    let h = harness().await;

    // Occupy the last id with a /30 of its own so the next one overflows.
    sqlx::query(
        "INSERT INTO virtual_machines (id, user_id, name, os_type, vcpu_count, memory_size_mib,
             disk_size_gb, boot_args, status, created_at, updated_at)
         VALUES (?, 1, 'filler', 'ubuntu', 1, 128, 1, '', 'stopped', 0, 0)",
    )
    .bind(vm_network::MAX_VM_ID as i64)
    .execute(h.controller.store().pool())
    .await
    .unwrap();

    let err = h.controller.create(request("web", 7)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceExhausted(_)));

    let vm = h
        .controller
        .store()
        .find_by_owner_and_name(7, "web")
        .await
        .unwrap()
        .expect("record kept for diagnosis");
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.network.is_none());
    assert!(!h.provisioner.steps().contains(&MockStep::SetupNetwork));
}

/// Poll until the VM reaches `status` or a few seconds pass.
async fn wait_for_status(h: &Harness, user_id: i64, name: &str, status: VmStatus) -> VirtualMachine {
    let store = h.controller.store();
    for _ in 0..100 {
        if let Some(vm) = store.find_by_owner_and_name(user_id, name).await.unwrap() {
            if vm.status == status {
                return vm;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("VM '{}' never reached {}", name, status);
}

#[tokio::test]
async fn test_abandoned_create_still_ends_in_error_and_can_be_deleted() {
    let h = harness().await;
    h.provisioner
        .delay_at(MockStep::PrepareImage, Duration::from_millis(300));
    h.provisioner
        .fail_at(MockStep::PrepareImage, "qemu-img: No space left on device");

    // the caller gives up while the image is still being prepared
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), h.controller.create(request("web", 7)))
            .await;
    assert!(abandoned.is_err());

    let vm = wait_for_status(&h, 7, "web", VmStatus::Error).await;
    let message = vm.last_error_message.as_deref().unwrap_or_default();
    assert!(message.contains("No space left on device"), "{}", message);

    // the name stays taken until the failed VM is deleted
    let err = h.controller.create(request("web", 7)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Conflict(_)));

    h.controller.delete(vm.id).await.expect("failed VM can be deleted");

    h.provisioner.clear_failure();
    h.provisioner.clear_delay();
    let created = h.controller.create(request("web", 7)).await.unwrap();
    assert_eq!(created.vm.status, VmStatus::Running);
}

#[tokio::test]
async fn test_abandoned_create_finishes_booting() {
    let h = harness().await;
    h.provisioner
        .delay_at(MockStep::Launch, Duration::from_millis(200));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), h.controller.create(request("web", 7)))
            .await;
    assert!(abandoned.is_err());

    let vm = wait_for_status(&h, 7, "web", VmStatus::Running).await;
    assert_eq!(h.transport.actions(), vec!["InstanceStart"]);
    tokio_test::assert_ok!(h.controller.stop(vm.id).await);
}

#[tokio::test]
async fn test_interrupted_operations_are_settled_at_startup() {
    let h = harness().await;
    let creating = h.controller.create(request("web", 7)).await.unwrap().vm.id;
    let stopping = h.controller.create(request("db", 7)).await.unwrap().vm.id;
    let running = h.controller.create(request("cache", 7)).await.unwrap().vm.id;

    // as left behind by an agent killed mid-operation
    let store = h.controller.store();
    store.set_status(creating, VmStatus::Creating).await.unwrap();
    store.set_status(stopping, VmStatus::Stopping).await.unwrap();

    assert_eq!(h.controller.recover_interrupted().await.unwrap(), 2);

    let vm = h.controller.get(creating).await.unwrap();
    assert_eq!(vm.status, VmStatus::Error);
    assert_eq!(
        vm.last_error_message.as_deref(),
        Some(format!("{} while creating", INTERRUPTED_MESSAGE).as_str())
    );
    assert_eq!(
        h.controller.get(stopping).await.unwrap().status,
        VmStatus::Error
    );
    assert_eq!(
        h.controller.get(running).await.unwrap().status,
        VmStatus::Running
    );

    // settled records are usable again
    h.controller.delete(creating).await.expect("delete after recovery");
    let stopped = h.controller.stop(stopping).await.unwrap();
    assert_eq!(stopped.status, VmStatus::Stopped);

    assert_eq!(h.controller.recover_interrupted().await.unwrap(), 0);
}

#[tokio::test]
async fn test_root_password_reaches_provisioning_but_is_not_stored() {
    let h = harness().await;
    let mut req = request("web", 7);
    req.root_password = Some("hunter2".to_string());

    let created = h.controller.create(req).await.unwrap();

    assert_eq!(h.provisioner.root_password().as_deref(), Some("hunter2"));
    let json = serde_json::to_string(&created.vm).unwrap();
    assert!(!json.contains("hunter2"));
    assert!(!json.contains("root_password"));
}
