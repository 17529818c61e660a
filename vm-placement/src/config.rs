use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Port the host agents listen on.
    #[serde(default = "default_host_agent_port")]
    pub host_agent_port: u16,

    /// Covers image customisation on the host, which takes minutes.
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    std::env::var("PLACEMENT_BIND").unwrap_or_else(|_| "0.0.0.0:5002".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("PLACEMENT_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".vm")
        .join("placement")
        .join("placement.db")
}

fn default_host_agent_port() -> u16 {
    std::env::var("SERVICE_VM_HOST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5003)
}

fn default_forward_timeout() -> u64 {
    std::env::var("PLACEMENT_FORWARD_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1500) // 25 minutes
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            host_agent_port: default_host_agent_port(),
            forward_timeout_secs: default_forward_timeout(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
