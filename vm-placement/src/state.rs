use std::time::Duration;

use sqlx::SqlitePool;

use crate::error::Result;
use crate::forward::HostAgentClient;
use crate::host::HostInventory;
use crate::service::PlacementService;

#[derive(Clone)]
pub struct AppState {
    pub placement: PlacementService,
}

impl AppState {
    pub fn new(pool: SqlitePool, host_agent_port: u16, forward_timeout: Duration) -> Result<Self> {
        let client = HostAgentClient::new(host_agent_port, forward_timeout)?;
        Ok(Self {
            placement: PlacementService::new(HostInventory::new(pool), client),
        })
    }
}
