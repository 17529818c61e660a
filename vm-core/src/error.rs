use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    Command(String),
    Internal(String),
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmError::Command(s) => write!(f, "Command failed: {}", s),
            VmError::Internal(s) => write!(f, "Internal error: {}", s),
        }
    }
}

pub type Result<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_failure_kind() {
        let err = VmError::Command("setup_network.sh exited 2".to_string());
        assert_eq!(err.to_string(), "Command failed: setup_network.sh exited 2");

        let err = VmError::Internal("subscriber already set".to_string());
        assert_eq!(err.to_string(), "Internal error: subscriber already set");
    }
}
