use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    agent::net::ip_range::IpRange,
    constants::{DEFAULT_KERNEL_CMD_LINE, TAP_DEVICE_PREFIX},
    error::{Error, Result},
};

/// Inbound create request, as posted by API clients.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub root_image_path: PathBuf,
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub cloud_init_path: Option<PathBuf>,
}

/// Everything spec derivation needs besides the request itself.
#[derive(Debug, Clone)]
pub struct SpecParams {
    pub ip_range: IpRange,
    pub socket_dir: PathBuf,
    pub vcpu_count: u8,
    pub memory_mib: u64,
}

/// Fully-resolved per-instance configuration. Derived once per create call;
/// every field below `identity` is a deterministic function of it, so two
/// concurrently-active specs can never collide as long as identities are
/// unique.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub identity: u8,
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub tap_name: String,
    pub mac: String,
    pub socket_path: PathBuf,
    pub kernel_cmdline: String,
    pub vcpu_count: u8,
    pub memory_mib: u64,
    pub kernel_path: PathBuf,
    pub root_image_path: PathBuf,
    pub cloud_init_path: Option<PathBuf>,
}

fn require_path(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

impl VmSpec {
    /// Pure derivation, no I/O. The guest's static network configuration is
    /// baked into the kernel command line (`ip=` in the form the kernel's
    /// nfsaddrs parser expects).
    pub fn derive(params: &SpecParams, request: &CreateRequest, identity: u8) -> Result<VmSpec> {
        require_path(&request.root_image_path, "root_image_path")?;
        require_path(&request.kernel_path, "kernel_path")?;

        let ip = params
            .ip_range
            .host(identity)
            .map_err(|err| Error::InvalidRequest(format!("{err:#}")))?;
        let gateway = params.ip_range.gateway();
        let netmask = params.ip_range.netmask();

        let kernel_cmdline =
            format!("{DEFAULT_KERNEL_CMD_LINE} ip={ip}::{gateway}:{netmask}::eth0:off");

        Ok(VmSpec {
            identity,
            ip,
            gateway,
            netmask,
            tap_name: format!("{TAP_DEVICE_PREFIX}{identity}"),
            mac: format!("02:FC:00:00:00:{identity:02x}"),
            socket_path: params.socket_dir.join(format!("firecracker-{identity}.sock")),
            kernel_cmdline,
            vcpu_count: params.vcpu_count,
            memory_mib: params.memory_mib,
            kernel_path: request.kernel_path.clone(),
            root_image_path: request.root_image_path.clone(),
            cloud_init_path: request.cloud_init_path.clone(),
        })
    }
}
