//! Resource-aware placement of new VMs onto registered compute hosts.

pub mod api_error;
pub mod config;
pub mod db;
pub mod error;
pub mod forward;
pub mod host;
pub mod ranking;
pub mod routes;
pub mod service;
pub mod state;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use api_error::{ApiError, ApiResult};
pub use config::Config;
pub use error::{PlacementError, Result};
pub use forward::{HostAgentClient, HostCreateRequest};
pub use host::{ClusterHost, HostInventory, HostRegistration};
pub use routes::create_app;
pub use service::{PlacementOutcome, PlacementRequest, PlacementService};
pub use state::AppState;
