use thiserror::Error;

pub type Result<T> = std::result::Result<T, TerminalError>;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Terminal not found: {0}")]
    NotFound(String),

    #[error("VM {vm_id} is not reachable: {reason}")]
    VmUnavailable { vm_id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Pseudo-terminal error: {0}")]
    Pty(#[from] nix::errno::Errno),

    #[error("Failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
