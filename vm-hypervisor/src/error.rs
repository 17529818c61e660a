use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Control socket {path} unreachable: {message}")]
    Transport { path: PathBuf, message: String },

    #[error("{operation} rejected with HTTP {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Control socket {} did not appear within {}s", .0.display(), .1.as_secs())]
    SocketTimeout(PathBuf, Duration),

    #[error("Invalid response from {operation}: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },
}
