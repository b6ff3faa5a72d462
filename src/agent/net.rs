pub mod device;
pub mod ip_range;

use std::path::Path;

use anyhow::{Context, bail};
use tracing::{debug, warn};

use crate::{
    agent::spec::VmSpec,
    error::{Error, Result},
};

#[derive(Debug, Clone)]
pub struct NetAgentConfig {
    pub bridge_name: String,
}

/// Owns the per-instance network plumbing: one tap device per live VM,
/// attached to the shared bridge, with anti-spoofing sysctls applied.
pub struct NetAgent {
    config: NetAgentConfig,
}

fn step<T>(result: anyhow::Result<T>, step: &'static str) -> Result<T> {
    result.map_err(|source| Error::Provisioning { step, source })
}

fn sysctl_path(key: &str, device: &str, knob: &str) -> String {
    format!("/proc/sys/net/{key}/conf/{device}/{knob}")
}

async fn sysctl_write(key: &str, device: &str, knob: &str, value: &str) -> anyhow::Result<()> {
    let path = sysctl_path(key, device, knob);
    tokio::fs::write(&path, value)
        .await
        .context(format!("writing {path}"))?;
    Ok(())
}

async fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("removing {}", path.display())),
    }
}

/// Undo list for a single provisioning operation. Steps are recorded as
/// they succeed and run in reverse when a later step fails.
#[derive(Default)]
struct Rollback {
    steps: Vec<Undo>,
}

enum Undo {
    DeleteTap(String),
}

impl Rollback {
    fn push(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    async fn run(mut self) {
        for undo in self.steps.drain(..).rev() {
            match undo {
                Undo::DeleteTap(name) => {
                    if let Err(err) = device::delete(&name).await {
                        warn!("rollback failed to delete tap {name}: {err:#}");
                    }
                }
            }
        }
    }
}

impl NetAgent {
    pub async fn new(config: NetAgentConfig) -> anyhow::Result<Self> {
        if !device::exists(&config.bridge_name).await? {
            bail!("bridge {} not found", config.bridge_name);
        }

        Ok(Self { config })
    }

    #[cfg(test)]
    pub(crate) fn unchecked(config: NetAgentConfig) -> Self {
        Self { config }
    }

    /// Sets up the instance's network identity. On failure everything this
    /// call created is removed again; the caller must treat any error as
    /// "this instance never started".
    pub async fn provision(&self, spec: &VmSpec) -> Result<()> {
        let mut rollback = Rollback::default();
        match self.provision_steps(spec, &mut rollback).await {
            Ok(()) => Ok(()),
            Err(err) => {
                rollback.run().await;
                Err(err)
            }
        }
    }

    async fn provision_steps(&self, spec: &VmSpec, rollback: &mut Rollback) -> Result<()> {
        let tap = &spec.tap_name;

        // a tap with this name can only be left over from a previous run
        if step(device::exists(tap).await, "querying stale tap device")? {
            warn!("removing stale tap device {tap}");
            step(device::delete(tap).await, "removing stale tap device")?;
        }

        step(device::tap_create(tap), "creating tap device")?;
        rollback.push(Undo::DeleteTap(tap.clone()));

        step(
            device::bridge_attach(tap, &self.config.bridge_name).await,
            "attaching tap device to bridge",
        )?;
        step(device::link_up(tap), "bringing tap device up")?;

        step(
            sysctl_write("ipv4", tap, "proxy_arp", "1").await,
            "enabling proxy arp",
        )?;
        step(
            sysctl_write("ipv6", tap, "disable_ipv6", "1").await,
            "disabling ipv6",
        )?;

        step(
            remove_stale_socket(&spec.socket_path).await,
            "removing stale control socket",
        )?;

        debug!("provisioned tap {tap} on bridge {}", self.config.bridge_name);
        Ok(())
    }

    /// Removes the instance's tap device and control socket. Idempotent;
    /// errors are logged because the instance is already going away.
    pub async fn teardown(&self, spec: &VmSpec) {
        let tap = &spec.tap_name;
        match device::exists(tap).await {
            Ok(true) => {
                if let Err(err) = device::delete(tap).await {
                    warn!("failed to delete tap {tap}: {err:#}");
                }
            }
            Ok(false) => {}
            Err(err) => warn!("failed to query tap {tap}: {err:#}"),
        }

        if let Err(err) = remove_stale_socket(&spec.socket_path).await {
            warn!("failed to remove control socket: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::spec::tests::test_spec;

    #[test]
    fn test_sysctl_paths() {
        assert_eq!(
            sysctl_path("ipv4", "fc-tap-6", "proxy_arp"),
            "/proc/sys/net/ipv4/conf/fc-tap-6/proxy_arp"
        );
        assert_eq!(
            sysctl_path("ipv6", "fc-tap-6", "disable_ipv6"),
            "/proc/sys/net/ipv6/conf/fc-tap-6/disable_ipv6"
        );
    }

    #[tokio::test]
    async fn test_remove_stale_socket_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firecracker-9.sock");

        tokio::fs::write(&path, b"").await.unwrap();
        remove_stale_socket(&path).await.unwrap();
        assert!(!path.exists());

        // second removal must not error
        remove_stale_socket(&path).await.unwrap();
    }

    // Requires CAP_NET_ADMIN; on unprivileged runners provisioning fails at
    // the first step, which still must leave no tap behind.
    #[tokio::test]
    async fn test_provision_failure_leaves_no_tap() {
        let agent = NetAgent::unchecked(NetAgentConfig {
            bridge_name: "pyre-no-such-bridge".to_string(),
        });

        let spec = test_spec(250);
        let err = agent.provision(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Provisioning { .. }));

        if let Ok(exists) = device::exists(&spec.tap_name).await {
            assert!(!exists, "tap {} survived rollback", spec.tap_name);
        }
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_for_missing_tap() {
        let agent = NetAgent::unchecked(NetAgentConfig {
            bridge_name: "pyre-no-such-bridge".to_string(),
        });

        let spec = test_spec(251);
        agent.teardown(&spec).await;
        agent.teardown(&spec).await;
    }
}
