use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    agent::{
        fleet::{FleetRegistry, InstanceHandle, StopMode},
        vmm::RunningInstance,
    },
    error::Result,
};

/// Spawns the monitoring task for a freshly launched instance. The task
/// owns the hypervisor child, blocks on its exit and releases the
/// instance's cancellation scope. Exit after an operator-initiated stop is
/// expected; any other exit is an anomaly and triggers the same teardown
/// and deregistration a delete would. The handle is returned so callers can
/// deterministically wait for the monitor to finish.
pub fn spawn_monitor(
    registry: Arc<FleetRegistry<RunningInstance>>,
    instance: Arc<RunningInstance>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut child) = instance.take_child().await else {
            return;
        };

        let status = child.wait().await;
        instance.scope().cancel();

        match status {
            Ok(status) if instance.stop_requested() => {
                debug!("instance {} exited after stop ({status})", instance.id());
            }
            Ok(status) => {
                warn!(
                    "instance {} hypervisor exited unexpectedly ({status})",
                    instance.id()
                );
                if instance.begin_stop() {
                    instance.release_resources().await;
                    registry.remove_entry(instance.id());
                }
            }
            Err(err) => {
                error!(
                    "failed waiting on instance {} hypervisor: {err}",
                    instance.id()
                );
                if instance.begin_stop() {
                    instance.release_resources().await;
                    registry.remove_entry(instance.id());
                }
            }
        }
    })
}

/// Stops the whole fleet. The forced path kills every hypervisor outright;
/// the graceful path asks every guest to quiesce, waits up to
/// `drain_window` for the processes to exit and force-stops whatever is
/// left. Partial failures are collected, never short-circuited.
pub async fn shutdown_fleet<H: InstanceHandle>(
    registry: &FleetRegistry<H>,
    mode: StopMode,
    drain_window: Duration,
) -> Result<()> {
    if mode == StopMode::Forced {
        return registry.shutdown_all(StopMode::Forced).await;
    }

    let claimed: Vec<Arc<H>> = registry
        .snapshot()
        .into_iter()
        .filter(|instance| instance.begin_stop())
        .collect();

    let mut failures = Vec::new();
    for instance in &claimed {
        if let Err(err) = instance.stop(StopMode::Graceful).await {
            failures.push((instance.id().to_string(), err));
        }
    }

    let drained = join_all(claimed.iter().map(|instance| instance.wait_stopped()));
    if timeout(drain_window, drained).await.is_err() {
        for instance in &claimed {
            if instance.is_stopped() {
                continue;
            }
            warn!(
                "instance {} did not quiesce within the drain window, forcing",
                instance.id()
            );
            if let Err(err) = instance.stop(StopMode::Forced).await {
                failures.push((instance.id().to_string(), err));
            }
        }
    }

    for instance in claimed {
        instance.release_resources().await;
        registry.remove_entry(instance.id());
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::ShutdownFailed { failures })
    }
}

/// Process-wide signal coordination: interrupt/terminate drain the fleet
/// gracefully, quit kills it, and either way the API server's scope is
/// cancelled afterwards so the process can exit.
pub async fn run_signal_listener<H: InstanceHandle>(
    registry: Arc<FleetRegistry<H>>,
    drain_window: Duration,
    server_scope: CancellationToken,
) -> anyhow::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let mode = tokio::select! {
        _ = interrupt.recv() => {
            info!("caught interrupt, requesting clean shutdown");
            StopMode::Graceful
        }
        _ = terminate.recv() => {
            info!("caught terminate, requesting clean shutdown");
            StopMode::Graceful
        }
        _ = quit.recv() => {
            info!("caught quit, forcing shutdown");
            StopMode::Forced
        }
    };

    if let Err(err) = shutdown_fleet(&registry, mode, drain_window).await {
        error!("fleet shutdown reported failures: {err}");
    }

    server_scope.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::process::Command;

    use super::*;
    use crate::agent::{
        fleet::testing::MockInstance,
        identity::IdentityAllocator,
        image::{ImageAgent, ImageAgentConfig},
        net::{NetAgent, NetAgentConfig},
        spec::tests::test_spec,
        vmm::{InstanceResources, LaunchedVmm, RunningInstance},
        vmm::client::VmmClient,
    };

    #[tokio::test(start_paused = true)]
    async fn test_graceful_drain_without_escalation() {
        let registry = FleetRegistry::new();
        let instances = [
            MockInstance::new("a"),
            MockInstance::new("b"),
            MockInstance::new("c"),
        ];
        for instance in &instances {
            registry.add(instance.clone()).unwrap();
        }

        shutdown_fleet(&registry, StopMode::Graceful, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(registry.is_empty());
        for instance in &instances {
            assert_eq!(instance.forced_stops(), 0);
            assert!(instance.released());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_window_escalates_to_forced() {
        let registry = FleetRegistry::new();
        let polite = MockInstance::new("polite");
        let stubborn = MockInstance::ignoring_graceful("stubborn");
        registry.add(polite.clone()).unwrap();
        registry.add(stubborn.clone()).unwrap();

        shutdown_fleet(&registry, StopMode::Graceful, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(registry.is_empty());
        assert_eq!(polite.forced_stops(), 0);
        assert_eq!(stubborn.forced_stops(), 1);
        assert!(polite.released() && stubborn.released());
    }

    async fn test_resources(image_dir: &std::path::Path) -> InstanceResources {
        InstanceResources {
            net: std::sync::Arc::new(NetAgent::unchecked(NetAgentConfig {
                bridge_name: "pyre-test-bridge".to_string(),
            })),
            image: std::sync::Arc::new(
                ImageAgent::new(ImageAgentConfig {
                    image_dir: image_dir.to_path_buf(),
                    cloud_localds_binary: PathBuf::from("cloud-localds"),
                })
                .await
                .unwrap(),
            ),
            identity: std::sync::Mutex::new(Some(
                std::sync::Arc::new(IdentityAllocator::new(2, 254))
                    .allocate()
                    .unwrap(),
            )),
        }
    }

    async fn launch_stub(program: &str, args: &[&str]) -> LaunchedVmm {
        let child = Command::new(program).args(args).spawn().unwrap();
        LaunchedVmm {
            client: VmmClient::new(PathBuf::from("/tmp/pyre-test-none.sock")),
            pid: child.id().unwrap(),
            child,
        }
    }

    #[tokio::test]
    async fn test_monitor_deregisters_on_unexpected_exit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FleetRegistry::new());

        let vmm = launch_stub("true", &[]).await;
        let instance = RunningInstance::new(
            "inst-1".to_string(),
            test_spec(250),
            dir.path().join("rootfs-250.img"),
            None,
            vmm,
            &CancellationToken::new(),
            test_resources(dir.path()).await,
        );
        registry.add(instance.clone()).unwrap();

        let monitor = spawn_monitor(registry.clone(), instance.clone());
        monitor.await.unwrap();

        assert!(instance.scope().is_cancelled());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_defers_to_delete_after_requested_stop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FleetRegistry::new());

        let vmm = launch_stub("sleep", &["30"]).await;
        let instance = RunningInstance::new(
            "inst-2".to_string(),
            test_spec(251),
            dir.path().join("rootfs-251.img"),
            None,
            vmm,
            &CancellationToken::new(),
            test_resources(dir.path()).await,
        );
        registry.add(instance.clone()).unwrap();

        let monitor = spawn_monitor(registry.clone(), instance.clone());

        registry.remove("inst-2", StopMode::Forced).await.unwrap();
        monitor.await.unwrap();

        assert!(instance.scope().is_cancelled());
        assert!(registry.is_empty());
    }
}
