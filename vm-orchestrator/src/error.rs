use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{step} failed: {output}")]
    ExternalProcess { step: String, output: String },

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] vm_hypervisor::DriverError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub(crate) fn external(step: impl Into<String>, output: impl Into<String>) -> Self {
        OrchestratorError::ExternalProcess {
            step: step.into(),
            output: output.into(),
        }
    }
}

impl From<vm_core::VmError> for OrchestratorError {
    fn from(err: vm_core::VmError) -> Self {
        OrchestratorError::external("command", err.to_string())
    }
}
