use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use pyre::agent::AgentConfig;
use pyre::constants::{
    DEFAULT_BRIDGE_NAME, DEFAULT_CLOUD_LOCALDS_BINARY, DEFAULT_DRAIN_WINDOW_SECS,
    DEFAULT_FIRECRACKER_BINARY, DEFAULT_IMAGE_DIR, DEFAULT_MEMORY_MIB, DEFAULT_SOCKET_DIR,
    DEFAULT_VCPU_COUNT, DEFAULT_VM_CIDR,
};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(rename = "api", default)]
    pub api_config: ApiConfig,

    #[serde(rename = "net", default)]
    pub net_config: NetConfig,

    #[serde(rename = "machine", default)]
    pub machine_config: MachineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(rename = "host", default = "default_host")]
    pub host: String,
    #[serde(rename = "port", default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    #[serde(rename = "bridge-name", default = "default_bridge_name")]
    pub bridge_name: String,
    #[serde(rename = "vm-cidr", default = "default_vm_cidr")]
    pub vm_cidr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineConfig {
    #[serde(rename = "firecracker-binary", default = "default_firecracker_binary")]
    pub firecracker_binary: PathBuf,
    #[serde(rename = "cloud-localds-binary", default = "default_cloud_localds_binary")]
    pub cloud_localds_binary: PathBuf,
    #[serde(rename = "socket-dir", default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(rename = "image-dir", default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(rename = "vcpu-count", default = "default_vcpu_count")]
    pub vcpu_count: u8,
    #[serde(rename = "memory-mib", default = "default_memory_mib")]
    pub memory_mib: u64,
    #[serde(rename = "drain-window-secs", default = "default_drain_window_secs")]
    pub drain_window_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_bridge_name() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}
fn default_vm_cidr() -> String {
    DEFAULT_VM_CIDR.to_string()
}
fn default_firecracker_binary() -> PathBuf {
    PathBuf::from(DEFAULT_FIRECRACKER_BINARY)
}
fn default_cloud_localds_binary() -> PathBuf {
    PathBuf::from(DEFAULT_CLOUD_LOCALDS_BINARY)
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_DIR)
}
fn default_image_dir() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGE_DIR)
}
fn default_vcpu_count() -> u8 {
    DEFAULT_VCPU_COUNT
}
fn default_memory_mib() -> u64 {
    DEFAULT_MEMORY_MIB
}
fn default_drain_window_secs() -> u64 {
    DEFAULT_DRAIN_WINDOW_SECS
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bridge_name: default_bridge_name(),
            vm_cidr: default_vm_cidr(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            firecracker_binary: default_firecracker_binary(),
            cloud_localds_binary: default_cloud_localds_binary(),
            socket_dir: default_socket_dir(),
            image_dir: default_image_dir(),
            vcpu_count: default_vcpu_count(),
            memory_mib: default_memory_mib(),
            drain_window_secs: default_drain_window_secs(),
        }
    }
}

async fn resolve_config_path(path_override: Option<PathBuf>) -> Option<PathBuf> {
    let config_path = path_override.or_else(|| std::env::var("PYRE_CONFIG").ok().map(PathBuf::from));

    if let Some(path) = config_path {
        return Some(path);
    }

    if let Ok(cwd) = std::env::current_dir() {
        let path = cwd.join("pyre.toml");
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(project_dirs) = directories::ProjectDirs::from("dev", "pyre", "pyre") {
        let path = project_dirs.config_dir().join("config.toml");
        if path.exists() {
            return Some(path);
        }
    }

    let path = PathBuf::from("/etc/pyre/config.toml");
    if path.exists() {
        return Some(path);
    }

    None
}

impl Config {
    /// Loads the config file if one can be found, otherwise starts from the
    /// built-in defaults; environment overrides apply either way so the
    /// daemon is runnable from the environment alone.
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let mut config = match resolve_config_path(path_override).await {
            Some(path) => {
                let config_str = read_to_string(&path).await?;
                toml::from_str(&config_str)?
            }
            None => {
                warn!("no config file found, using defaults");
                Self::default()
            }
        };

        if let Ok(host) = std::env::var("PYRE_HOST") {
            config.api_config.host = host;
        }
        if let Ok(port) = std::env::var("PYRE_PORT") {
            config.api_config.port = port.parse()?;
        }
        if let Ok(socket_dir) = std::env::var("FIRECRACKER_SOCKET_DIR") {
            config.machine_config.socket_dir = PathBuf::from(socket_dir);
        }

        Ok(config)
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            bridge_name: self.net_config.bridge_name.clone(),
            vm_cidr: self.net_config.vm_cidr.clone(),
            socket_dir: self.machine_config.socket_dir.clone(),
            image_dir: self.machine_config.image_dir.clone(),
            firecracker_binary: self.machine_config.firecracker_binary.clone(),
            cloud_localds_binary: self.machine_config.cloud_localds_binary.clone(),
            vcpu_count: self.machine_config.vcpu_count,
            memory_mib: self.machine_config.memory_mib,
            drain_window: Duration::from_secs(self.machine_config.drain_window_secs),
        }
    }
}
