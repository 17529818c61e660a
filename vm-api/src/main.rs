use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use vm_api::broker::connect_broker;
use vm_api::{create_app, start_registration_task, AppState, Config};
use vm_hypervisor::UnixSocketTransport;
use vm_orchestrator::db::{backup_database, create_pool, run_migrations};
use vm_orchestrator::{MachineStore, ScriptProvisioner, VmLifecycleController};
use vm_replication::{spawn_all, ReplicaStore, RestartPolicy};
use vm_terminal::SshLauncher;

#[tokio::main]
async fn main() -> Result<()> {
    vm_core::tracing_init::init_with_defaults(
        "vm_api=debug,vm_orchestrator=debug,vm_replication=info,vm_terminal=info,tower_http=debug",
    )?;

    info!("Starting vm-api host agent...");

    // Load configuration
    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, scripts_dir={}",
        config.bind_addr,
        config.db_path.display(),
        config.scripts_dir.display()
    );

    // Database setup
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    // Replicated reference data
    let broker = connect_broker(&config.broker).await?;
    let feeds = spawn_all(
        &config.exchanges,
        &config.replication_service,
        broker.clone(),
        ReplicaStore::new(pool.clone()),
        RestartPolicy::default(),
    );
    info!(
        "{} replication feed(s) started for service {}",
        feeds.len(),
        config.replication_service
    );

    // Host registration
    match &config.cluster_host {
        Some(cluster_host) => {
            tokio::spawn(start_registration_task(
                cluster_host.clone(),
                config.advertise_ip.clone(),
                config.registration_interval_secs,
            ));
        }
        None => info!("SERVICE_CLUSTER_HOST not set, host registration disabled"),
    }

    let controller = VmLifecycleController::new(
        MachineStore::new(pool),
        Arc::new(ScriptProvisioner::new(config.scripts_dir.clone())),
        Arc::new(UnixSocketTransport::new()),
        config.layout.clone(),
    );
    let recovered = controller.recover_interrupted().await?;
    if recovered > 0 {
        info!("{} VM(s) left mid-operation moved to error", recovered);
    }
    let app = create_app(AppState::new(controller, Arc::new(SshLauncher::default())));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    let served = axum::serve(listener, app).await;
    broker.close().await?;
    served?;

    Ok(())
}
