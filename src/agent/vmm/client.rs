use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, header};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::debug;

/// Thin client for the hypervisor's control protocol: Firecracker's HTTP
/// API served on the per-instance unix socket.
#[derive(Debug, Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
}

#[derive(Serialize)]
struct BootSource<'a> {
    kernel_image_path: &'a str,
    boot_args: &'a str,
}

#[derive(Serialize)]
struct Drive<'a> {
    drive_id: &'a str,
    path_on_host: &'a str,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Serialize)]
struct NetworkInterface<'a> {
    iface_id: &'a str,
    guest_mac: &'a str,
    host_dev_name: &'a str,
}

#[derive(Serialize)]
struct MachineConfig {
    vcpu_count: u8,
    mem_size_mib: u64,
}

#[derive(Serialize)]
struct Action<'a> {
    action_type: &'a str,
}

impl VmmClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context(format!(
                "connecting to control socket {}",
                self.socket_path.display()
            ))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("control socket handshake")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("control socket connection error: {err}");
            }
        });

        let payload = serde_json::to_vec(body)?;
        let request = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(payload)))?;

        let response = sender
            .send_request(request)
            .await
            .context(format!("PUT {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            bail!(
                "PUT {path} returned {status}: {}",
                String::from_utf8_lossy(&body)
            );
        }

        Ok(())
    }

    pub async fn set_machine_config(&self, vcpu_count: u8, mem_size_mib: u64) -> Result<()> {
        self.put(
            "/machine-config",
            &MachineConfig {
                vcpu_count,
                mem_size_mib,
            },
        )
        .await
    }

    pub async fn set_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<()> {
        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: &kernel_path.to_string_lossy(),
                boot_args,
            },
        )
        .await
    }

    pub async fn add_drive(
        &self,
        drive_id: &str,
        path_on_host: &Path,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        self.put(
            &format!("/drives/{drive_id}"),
            &Drive {
                drive_id,
                path_on_host: &path_on_host.to_string_lossy(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    pub async fn add_network_interface(
        &self,
        iface_id: &str,
        guest_mac: &str,
        host_dev_name: &str,
    ) -> Result<()> {
        self.put(
            &format!("/network-interfaces/{iface_id}"),
            &NetworkInterface {
                iface_id,
                guest_mac,
                host_dev_name,
            },
        )
        .await
    }

    pub async fn instance_start(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "InstanceStart",
            },
        )
        .await
    }

    /// Asks the guest to quiesce (ctrl-alt-del); the hypervisor process
    /// exits once the guest has shut down.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &Action {
                action_type: "SendCtrlAltDel",
            },
        )
        .await
    }
}
