pub mod fleet;
pub mod identity;
pub mod image;
pub mod net;
pub mod spec;
pub mod supervisor;
pub mod vmm;

use std::{net::Ipv4Addr, path::PathBuf, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    agent::{
        fleet::{FleetRegistry, InstanceHandle, StopMode},
        identity::IdentityAllocator,
        image::{ImageAgent, ImageAgentConfig},
        net::{NetAgent, NetAgentConfig, ip_range::IpRange},
        spec::{CreateRequest, SpecParams, VmSpec},
        supervisor::spawn_monitor,
        vmm::{InstanceResources, RunningInstance, VmmLauncher, VmmLauncherConfig},
    },
    constants::FIRST_IDENTITY,
    error::Result,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bridge_name: String,
    pub vm_cidr: String,
    pub socket_dir: PathBuf,
    pub image_dir: PathBuf,
    pub firecracker_binary: PathBuf,
    pub cloud_localds_binary: PathBuf,
    pub vcpu_count: u8,
    pub memory_mib: u64,
    pub drain_window: Duration,
}

/// Composes the sub-agents into the create/delete pipelines. Everything a
/// failed create already provisioned is rolled back, in reverse, before the
/// error reaches the caller.
pub struct Agent {
    identities: Arc<IdentityAllocator>,
    image: Arc<ImageAgent>,
    net: Arc<NetAgent>,
    launcher: VmmLauncher,
    spec_params: SpecParams,
    pub fleet: Arc<FleetRegistry<RunningInstance>>,
    pub drain_window: Duration,
    scope: CancellationToken,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> anyhow::Result<Arc<Self>> {
        let ip_range = IpRange::from_cidr(&config.vm_cidr)?;
        tokio::fs::create_dir_all(&config.socket_dir).await?;

        let net = NetAgent::new(NetAgentConfig {
            bridge_name: config.bridge_name,
        })
        .await?;
        let image = ImageAgent::new(ImageAgentConfig {
            image_dir: config.image_dir,
            cloud_localds_binary: config.cloud_localds_binary,
        })
        .await?;

        let identities = IdentityAllocator::new(FIRST_IDENTITY, ip_range.max_host());

        let spec_params = SpecParams {
            ip_range,
            socket_dir: config.socket_dir,
            vcpu_count: config.vcpu_count,
            memory_mib: config.memory_mib,
        };

        Ok(Arc::new(Self {
            identities: Arc::new(identities),
            image: Arc::new(image),
            net: Arc::new(net),
            launcher: VmmLauncher::new(VmmLauncherConfig {
                firecracker_binary: config.firecracker_binary,
            }),
            spec_params,
            fleet: Arc::new(FleetRegistry::new()),
            drain_window: config.drain_window,
            scope: CancellationToken::new(),
        }))
    }

    /// Provisions and boots one microVM: identity, spec, scratch images,
    /// tap device, hypervisor process, registry entry, monitor task.
    ///
    /// The identity lease has exactly one owner at any point: this function
    /// until the [`RunningInstance`] is constructed, the instance's
    /// resources afterwards. Any failure before the handover drops the
    /// lease here; any failure after it goes through `release_resources`.
    pub async fn create_vm(self: &Arc<Self>, request: CreateRequest) -> Result<(Ipv4Addr, String)> {
        let lease = self.identities.allocate()?;
        let identity = lease.value();

        let spec = VmSpec::derive(&self.spec_params, &request, identity)?;
        let id = Uuid::new_v4().to_string();

        let scratch = self.image.prepare(&spec.root_image_path, identity).await?;

        let seed = match &spec.cloud_init_path {
            Some(user_data) => {
                match self.image.prepare_cloud_init(user_data, &id, identity).await {
                    Ok(seed) => Some(seed),
                    Err(err) => {
                        self.image.cleanup(&scratch).await;
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        if let Err(err) = self.net.provision(&spec).await {
            self.cleanup_images(&scratch, seed.as_deref()).await;
            return Err(err);
        }

        let vmm = match self
            .launcher
            .launch(&id, &spec, &scratch, seed.as_deref())
            .await
        {
            Ok(vmm) => vmm,
            Err(err) => {
                self.net.teardown(&spec).await;
                self.cleanup_images(&scratch, seed.as_deref()).await;
                return Err(err);
            }
        };

        let ip = spec.ip;
        let instance = RunningInstance::new(
            id.clone(),
            spec,
            scratch,
            seed,
            vmm,
            &self.scope,
            InstanceResources {
                net: self.net.clone(),
                image: self.image.clone(),
                identity: std::sync::Mutex::new(Some(lease)),
            },
        );

        if let Err(err) = self.fleet.add(instance.clone()) {
            // freshly generated uuid collided; give everything back
            instance.begin_stop();
            let _ = instance.stop(StopMode::Forced).await;
            instance.release_resources().await;
            return Err(err);
        }

        spawn_monitor(self.fleet.clone(), instance);
        info!("created instance {id} at {ip}");

        Ok((ip, id))
    }

    async fn cleanup_images(&self, scratch: &std::path::Path, seed: Option<&std::path::Path>) {
        self.image.cleanup(scratch).await;
        if let Some(seed) = seed {
            self.image.cleanup(seed).await;
        }
    }

    /// Stops the instance's hypervisor and releases all of its resources.
    pub async fn delete_vm(&self, id: &str) -> Result<()> {
        self.fleet.remove(id, StopMode::Forced).await
    }
}
