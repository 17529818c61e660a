//! HTTP and websocket surface of the host agent.

pub mod broker;
pub mod config;
pub mod error;
pub mod registration;
pub mod resolver;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use registration::{start_registration_task, HostReport};
pub use routes::create_app;
pub use state::AppState;
