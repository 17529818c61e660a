use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlacementError>;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Host not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The chosen host agent could not be reached or refused the request.
    #[error("Forwarding to {url} failed: {message}")]
    Forward {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
