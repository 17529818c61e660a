use serde::Deserialize;
use std::path::PathBuf;
use vm_orchestrator::VmLayout;
use vm_replication::Exchanges;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    #[serde(default = "default_layout")]
    pub layout: VmLayout,

    /// Placement service base URL. Host registration is off without it.
    #[serde(default = "default_cluster_host")]
    pub cluster_host: Option<String>,

    #[serde(default = "default_advertise_ip")]
    pub advertise_ip: Option<String>,

    #[serde(default = "default_registration_interval")]
    pub registration_interval_secs: u64,

    #[serde(default = "default_broker")]
    pub broker: BrokerConfig,

    #[serde(default = "default_exchanges")]
    pub exchanges: Exchanges,

    #[serde(default = "default_replication_service")]
    pub replication_service: String,
}

/// RabbitMQ connection settings. Without `host` the agent uses an
/// in-process broker.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn default_bind_addr() -> String {
    env_or("VM_API_BIND", "0.0.0.0:5003")
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VM_API_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".vm")
        .join("host-agent")
        .join("vm.db")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from(env_or("VM_SCRIPTS_DIR", "./script_sh"))
}

fn default_layout() -> VmLayout {
    let defaults = VmLayout::default();
    VmLayout {
        root_dir: env_opt("VM_ROOT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.root_dir),
        socket_dir: env_opt("VM_SOCKET_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.socket_dir),
        log_dir: env_opt("VM_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.log_dir),
        kernel_image_name: env_opt("VM_KERNEL_IMAGE").unwrap_or(defaults.kernel_image_name),
    }
}

fn default_cluster_host() -> Option<String> {
    env_opt("SERVICE_CLUSTER_HOST").map(|url| url.trim_end_matches('/').to_string())
}

fn default_advertise_ip() -> Option<String> {
    env_opt("VM_API_ADVERTISE_IP")
}

fn default_registration_interval() -> u64 {
    std::env::var("VM_REGISTRATION_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300) // 5 minutes
}

fn default_broker() -> BrokerConfig {
    BrokerConfig {
        host: env_opt("RABBITMQ_HOST"),
        port: std::env::var("RABBITMQ_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5672),
        user: env_or("RABBITMQ_USER", "guest"),
        password: env_or("RABBITMQ_PASSWORD", "guest"),
    }
}

fn default_exchanges() -> Exchanges {
    let defaults = Exchanges::default();
    Exchanges {
        offers: env_opt("SERVICE_VM_OFFER_EXCHANGE").unwrap_or(defaults.offers),
        images: env_opt("SERVICE_SYSTEM_IMAGE_EXCHANGE").unwrap_or(defaults.images),
        users: env_opt("SERVICE_USER_EXCHANGE").unwrap_or(defaults.users),
    }
}

fn default_replication_service() -> String {
    env_or("VM_REPLICATION_SERVICE", "vm-host")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            scripts_dir: default_scripts_dir(),
            layout: default_layout(),
            cluster_host: default_cluster_host(),
            advertise_ip: default_advertise_ip(),
            registration_interval_secs: default_registration_interval(),
            broker: default_broker(),
            exchanges: default_exchanges(),
            replication_service: default_replication_service(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
