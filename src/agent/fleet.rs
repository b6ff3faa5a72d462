use std::sync::Arc;

use async_trait::async_trait;
use papaya::HashMap;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the guest to quiesce over the control protocol.
    Graceful,
    /// Kill the hypervisor process outright.
    Forced,
}

/// Capabilities the registry needs from a running instance. Implemented by
/// [`RunningInstance`](crate::agent::vmm::RunningInstance); tests supply
/// mocks so registry and supervisor semantics are checked without a
/// hypervisor.
#[async_trait]
pub trait InstanceHandle: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Transition registered -> stopping. Returns false if some other path
    /// (a delete, the monitor, a fleet shutdown) already claimed the stop;
    /// the claimant owns teardown.
    fn begin_stop(&self) -> bool;

    /// True once the hypervisor process has exited.
    fn is_stopped(&self) -> bool;

    async fn stop(&self, mode: StopMode) -> Result<()>;

    /// Releases everything the instance holds (tap device, control socket,
    /// scratch images, identity). Best-effort; must be called exactly once,
    /// by whoever won `begin_stop`.
    async fn release_resources(&self);

    /// Resolves once the hypervisor process has exited.
    async fn wait_stopped(&self);
}

/// The single source of truth for which instances exist. Keys are the
/// externally visible instance ids; per-key mutual exclusion comes from the
/// instance's own stop transition, so operations on different instances
/// never serialize against each other.
pub struct FleetRegistry<H> {
    instances: HashMap<String, Arc<H>>,
}

impl<H: InstanceHandle> FleetRegistry<H> {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
        }
    }

    pub fn add(&self, instance: Arc<H>) -> Result<()> {
        let instances = self.instances.pin();
        if instances.contains_key(instance.id()) {
            return Err(Error::DuplicateId(instance.id().to_string()));
        }
        instances.insert(instance.id().to_string(), instance);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<H>> {
        let instances = self.instances.pin();
        instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.instances.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.pin().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.instances.pin().values().cloned().collect()
    }

    /// Deletes the map entry only. Teardown must already have happened;
    /// "remove without shutdown" is not a supported path.
    pub(crate) fn remove_entry(&self, id: &str) {
        self.instances.pin().remove(id);
    }

    /// Stops the instance, releases its resources and deletes the entry.
    /// The entry goes away even when the stop call fails, so the registry
    /// never keeps referencing an unreachable instance; the failure is
    /// still reported to the caller.
    pub async fn remove(&self, id: &str, mode: StopMode) -> Result<()> {
        let instance = self.get(id)?;
        if !instance.begin_stop() {
            // already on its way out; indistinguishable from absent
            return Err(Error::NotFound(id.to_string()));
        }

        let stopped = instance.stop(mode).await;
        instance.release_resources().await;
        self.remove_entry(id);
        info!("removed instance {id}");

        stopped
    }

    /// Stops every registered instance. One instance's failure never
    /// prevents the rest from being attempted; failures are collected and
    /// reported together.
    pub async fn shutdown_all(&self, mode: StopMode) -> Result<()> {
        let mut failures = Vec::new();

        for instance in self.snapshot() {
            if !instance.begin_stop() {
                continue;
            }
            if let Err(err) = instance.stop(mode).await {
                failures.push((instance.id().to_string(), err));
            }
            instance.release_resources().await;
            self.remove_entry(instance.id());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ShutdownFailed { failures })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockInstance;
    use super::*;

    #[tokio::test]
    async fn test_add_rejects_duplicate_ids() {
        let registry = FleetRegistry::new();
        registry.add(MockInstance::new("a")).unwrap();

        let err = registry.add(MockInstance::new("a")).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_not_found() {
        let registry = FleetRegistry::<MockInstance>::new();
        assert!(matches!(registry.get("nope"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_unknown_id_has_no_side_effects() {
        let registry = FleetRegistry::new();
        let instance = MockInstance::new("a");
        registry.add(instance.clone()).unwrap();

        let err = registry
            .remove("nope", StopMode::Forced)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(registry.len(), 1);
        assert!(!instance.released());
    }

    #[tokio::test]
    async fn test_remove_stops_releases_and_deletes() {
        let registry = FleetRegistry::new();
        let instance = MockInstance::new("a");
        registry.add(instance.clone()).unwrap();

        registry.remove("a", StopMode::Forced).await.unwrap();

        assert!(instance.released());
        assert!(registry.is_empty());

        // second remove observes an absent instance
        let err = registry.remove("a", StopMode::Forced).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_reports_stop_failure_but_still_deletes() {
        let registry = FleetRegistry::new();
        let instance = MockInstance::failing("a");
        registry.add(instance.clone()).unwrap();

        let err = registry.remove("a", StopMode::Forced).await.unwrap_err();
        assert!(matches!(err, Error::Hypervisor(_)));
        assert!(instance.released());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_all_attempts_every_instance() {
        let registry = FleetRegistry::new();
        let ok1 = MockInstance::new("ok1");
        let bad = MockInstance::failing("bad");
        let ok2 = MockInstance::new("ok2");
        for instance in [&ok1, &bad, &ok2] {
            registry.add(instance.clone()).unwrap();
        }

        let err = registry.shutdown_all(StopMode::Forced).await.unwrap_err();
        let Error::ShutdownFailed { failures } = err else {
            panic!("expected ShutdownFailed");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");

        assert!(registry.is_empty());
        assert!(ok1.released() && bad.released() && ok2.released());
    }
}
