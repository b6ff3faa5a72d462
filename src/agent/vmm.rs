pub mod client;

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    agent::{
        fleet::{InstanceHandle, StopMode},
        identity::IdentityLease,
        image::ImageAgent,
        net::NetAgent,
        spec::VmSpec,
        vmm::client::VmmClient,
    },
    error::{Error, Result},
};

const SOCKET_WAIT: Duration = Duration::from_secs(2);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct VmmLauncherConfig {
    pub firecracker_binary: PathBuf,
}

/// Spawns and boots the external hypervisor process for one instance.
pub struct VmmLauncher {
    config: VmmLauncherConfig,
}

/// A freshly spawned and started hypervisor, before it is wrapped into a
/// [`RunningInstance`].
pub struct LaunchedVmm {
    pub client: VmmClient,
    pub pid: u32,
    pub child: Child,
}

async fn wait_for_socket(path: &Path) -> io::Result<()> {
    let deadline = Instant::now() + SOCKET_WAIT;
    loop {
        if tokio::fs::metadata(path).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("control socket {} never appeared", path.display()),
            ));
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
}

impl VmmLauncher {
    pub fn new(config: VmmLauncherConfig) -> Self {
        Self { config }
    }

    /// Spawns the hypervisor bound to the spec's control socket, pushes the
    /// machine configuration over it and issues the start command. A
    /// process that fails anywhere before a successful start is killed
    /// before the error returns, so no orphan stays attached to the socket.
    pub async fn launch(
        &self,
        id: &str,
        spec: &VmSpec,
        root_image: &Path,
        seed_image: Option<&Path>,
    ) -> Result<LaunchedVmm> {
        let mut child = Command::new(&self.config.firecracker_binary)
            .arg("--api-sock")
            .arg(&spec.socket_path)
            .arg("--id")
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::ProcessSpawnFailed)?;

        let Some(pid) = child.id() else {
            return Err(Error::ProcessSpawnFailed(io::Error::other(
                "hypervisor exited before it could be configured",
            )));
        };

        let client = VmmClient::new(spec.socket_path.clone());
        match Self::configure_and_start(&client, spec, root_image, seed_image).await {
            Ok(()) => {
                debug!("started hypervisor pid {pid} for instance {id}");
                Ok(LaunchedVmm { client, pid, child })
            }
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(err)
            }
        }
    }

    async fn configure_and_start(
        client: &VmmClient,
        spec: &VmSpec,
        root_image: &Path,
        seed_image: Option<&Path>,
    ) -> Result<()> {
        wait_for_socket(&spec.socket_path)
            .await
            .map_err(Error::ProcessSpawnFailed)?;

        let start = |err: anyhow::Error| Error::MachineStartFailed(format!("{err:#}"));

        client
            .set_machine_config(spec.vcpu_count, spec.memory_mib)
            .await
            .map_err(start)?;
        client
            .set_boot_source(&spec.kernel_path, &spec.kernel_cmdline)
            .await
            .map_err(start)?;
        client.add_drive("1", root_image, true, false).await.map_err(start)?;
        if let Some(seed) = seed_image {
            client.add_drive("2", seed, false, true).await.map_err(start)?;
        }
        client
            .add_network_interface("eth0", &spec.mac, &spec.tap_name)
            .await
            .map_err(start)?;
        client.instance_start().await.map_err(start)?;

        Ok(())
    }
}

/// Agents a running instance needs for its own teardown, plus the identity
/// lease the instance took over from the create pipeline.
pub struct InstanceResources {
    pub net: Arc<NetAgent>,
    pub image: Arc<ImageAgent>,
    pub identity: std::sync::Mutex<Option<IdentityLease>>,
}

/// One registered microVM: the hypervisor process handle, its control
/// connection and everything required to undo its footprint. Owned by the
/// fleet registry; the monitor task holds a non-owning reference.
pub struct RunningInstance {
    id: String,
    pub spec: VmSpec,
    scratch_image: PathBuf,
    seed_image: Option<PathBuf>,

    client: VmmClient,
    pid: u32,
    child: Mutex<Option<Child>>,

    scope: CancellationToken,
    stopping: AtomicBool,

    resources: InstanceResources,
}

impl RunningInstance {
    pub fn new(
        id: String,
        spec: VmSpec,
        scratch_image: PathBuf,
        seed_image: Option<PathBuf>,
        vmm: LaunchedVmm,
        parent_scope: &CancellationToken,
        resources: InstanceResources,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            spec,
            scratch_image,
            seed_image,
            client: vmm.client,
            pid: vmm.pid,
            child: Mutex::new(Some(vmm.child)),
            scope: parent_scope.child_token(),
            stopping: AtomicBool::new(false),
            resources,
        })
    }

    pub fn ip(&self) -> std::net::Ipv4Addr {
        self.spec.ip
    }

    /// The instance's cancellation scope; cancelled by the monitor once the
    /// hypervisor process has exited.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Hands the child to the monitor task; only one caller gets it.
    pub(crate) async fn take_child(&self) -> Option<Child> {
        self.child.lock().await.take()
    }
}

#[async_trait]
impl InstanceHandle for RunningInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn begin_stop(&self) -> bool {
        !self.stopping.swap(true, Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.scope.is_cancelled()
    }

    async fn stop(&self, mode: StopMode) -> Result<()> {
        match mode {
            StopMode::Graceful => match self.client.send_ctrl_alt_del().await {
                Ok(()) => Ok(()),
                // a dead hypervisor is as quiesced as it gets
                Err(_) if self.scope.is_cancelled() => Ok(()),
                Err(err) => Err(Error::Hypervisor(err)),
            },
            StopMode::Forced => match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(errno) => Err(Error::Hypervisor(anyhow::anyhow!(
                    "kill({}) failed: {errno}",
                    self.pid
                ))),
            },
        }
    }

    async fn release_resources(&self) {
        self.resources.net.teardown(&self.spec).await;
        self.resources.image.cleanup(&self.scratch_image).await;
        if let Some(seed) = &self.seed_image {
            self.resources.image.cleanup(seed).await;
        }
        // dropping the lease returns the identity to the pool; the Option
        // take makes the return single-shot
        drop(
            self.resources
                .identity
                .lock()
                .expect("identity lease poisoned")
                .take(),
        );
    }

    async fn wait_stopped(&self) {
        self.scope.cancelled().await;
    }
}
