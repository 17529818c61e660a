use async_trait::async_trait;
use tokio::process::Command;

use crate::error::Result;

/// Maps a VM id to the address a shell should connect to.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, vm_id: &str) -> Result<String>;
}

/// Builds the interactive process attached to a session's terminal.
pub trait ShellLauncher: Send + Sync {
    fn command(&self, address: &str, username: &str) -> Command;
}

/// Interactive ssh without host key checking. VM host keys change on
/// every rebuild.
#[derive(Debug, Clone, Default)]
pub struct SshLauncher {
    pub identity_file: Option<std::path::PathBuf>,
}

impl ShellLauncher for SshLauncher {
    fn command(&self, address: &str, username: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
        ]);
        if let Some(identity) = &self.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", username, address));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_command_line() {
        let cmd = SshLauncher::default().command("172.16.0.6", "root");
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "ssh");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args.last().map(String::as_str), Some("root@172.16.0.6"));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }
}
