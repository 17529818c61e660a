use std::time::Duration;

use anyhow::Result;
use tracing::info;
use vm_placement::db::{create_pool, run_migrations};
use vm_placement::{create_app, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    vm_core::tracing_init::init_with_defaults("vm_placement=debug,tower_http=debug")?;

    info!("Starting vm-placement service...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, host_agent_port={}",
        config.bind_addr,
        config.db_path.display(),
        config.host_agent_port
    );

    let pool = create_pool(&config.db_path).await?;
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::new(
        pool,
        config.host_agent_port,
        Duration::from_secs(config.forward_timeout_secs),
    )?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
