//! Lifecycle controller
//!
//! Drives instances through `Provisioning -> Running -> Deprovisioning ->
//! Stopped`, with `Failed` on any unrecoverable error. Owns the registry,
//! the network allocator, the console hub and the launcher, and is the
//! only component that mutates instance state.

use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NodeConfig;
use crate::console::{ConsoleHub, LogSubscription};
use crate::launcher::{FirecrackerLauncher, LaunchRequest, ProcessHandle, VmLauncher};
use crate::models::{
    ExitReason, InstanceId, InstanceInfo, InstanceSpec, InstanceState, LogRecord, PortMapping,
};
use crate::network::{NetworkAllocator, NetworkLease};
use crate::registry::{Instance, Registry};
use crate::{Error, Result};

/// How often `drain` rechecks an instance that is still provisioning
const PROVISION_POLL: Duration = Duration::from_millis(20);

/// Slack on top of the launch timeout before drain gives up on a provision
const PROVISION_SETTLE_SLACK: Duration = Duration::from_secs(5);

/// Outcome of a drain
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainSummary {
    pub drained: usize,
    pub clean: usize,
    pub forced: usize,
    pub failures: Vec<DrainFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrainFailure {
    pub id: InstanceId,
    pub error: String,
}

/// Manages the microVMs of one node.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<NodeConfig>,
    registry: Registry,
    network: Arc<NetworkAllocator>,
    console: Arc<ConsoleHub>,
    launcher: Arc<dyn VmLauncher>,
}

impl Orchestrator {
    /// Orchestrator launching real Firecracker VMs
    pub fn new(config: NodeConfig) -> Result<Self> {
        let launcher = Arc::new(FirecrackerLauncher::new(config.firecracker.clone()));
        Self::with_launcher(config, launcher)
    }

    /// Orchestrator with a custom launcher; networking still follows `config`
    pub fn with_launcher(config: NodeConfig, launcher: Arc<dyn VmLauncher>) -> Result<Self> {
        let network = Arc::new(
            NetworkAllocator::from_config(config.network.clone())
                .with_tap_owner_base(config.firecracker.uid_base),
        );
        Self::with_components(config, launcher, network)
    }

    pub fn with_components(
        config: NodeConfig,
        launcher: Arc<dyn VmLauncher>,
        network: Arc<NetworkAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            console: Arc::new(ConsoleHub::new(config.console.clone())),
            config: Arc::new(config),
            registry: Registry::new(),
            network,
            launcher,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &NetworkAllocator {
        &self.network
    }

    /// Validate, lease, launch. Nothing stays registered on failure.
    ///
    /// Runs to completion on its own task, so a caller that goes away
    /// mid-launch leaves either a `Running` instance or nothing.
    pub async fn provision(&self, spec: InstanceSpec) -> Result<InstanceId> {
        spec.validate()?;
        let this = self.clone();
        detached(async move { this.provision_detached(spec).await }).await
    }

    async fn provision_detached(&self, spec: InstanceSpec) -> Result<InstanceId> {
        let id = InstanceId::generate();
        let lease = {
            let network = self.network.clone();
            let id = id.clone();
            blocking(move || network.allocate(&id)).await?
        };
        let network_info = lease.info().clone();

        if let Err(rejected) = self.registry.insert(Instance::new(id.clone(), spec.clone(), lease)) {
            let (_, lease) = rejected.into_parts();
            if let Some(lease) = lease {
                release_lease(&self.network, lease).await;
            }
            return Err(Error::Other(format!("instance id {} already registered", id)));
        }

        tracing::info!(
            instance = %id,
            image = %spec.container_reference,
            vcpus = spec.vcpus,
            memory_mb = spec.memory_mb,
            guest = %network_info.guest_addr,
            "Provisioning instance"
        );

        let console = self.console.open(&id);
        let request = LaunchRequest {
            id: id.clone(),
            spec,
            network: network_info,
            console,
        };

        let launch_timeout = self.config.launch_timeout();
        let launched = match tokio::time::timeout(launch_timeout, self.launcher.launch(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Launch(format!(
                "not running after {}ms",
                launch_timeout.as_millis()
            ))),
        };

        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(instance = %id, error = %e, "Launch failed");
                self.abort_provision(&id).await;
                return Err(match e {
                    Error::Launch(_) => e,
                    other => Error::launch("launch", other),
                });
            }
        };

        self.registry.attach_process(&id, handle.clone())?;
        self.registry.update_state(&id, InstanceState::Running)?;
        self.spawn_monitor(id.clone(), handle);

        Ok(id)
    }

    async fn abort_provision(&self, id: &InstanceId) {
        if let Err(e) = self.registry.update_state(id, InstanceState::Failed) {
            tracing::warn!(instance = %id, error = %e, "Failed to mark instance failed");
        }
        if let Some(instance) = self.registry.remove(id) {
            let (_, lease) = instance.into_parts();
            if let Some(lease) = lease {
                release_lease(&self.network, lease).await;
            }
        }
        self.console.remove(id);
    }

    /// Watches for exits nobody asked for
    fn spawn_monitor(&self, id: InstanceId, handle: ProcessHandle) {
        let registry = self.registry.clone();
        let network = self.network.clone();
        let console = self.console.clone();

        tokio::spawn(async move {
            let reason = handle.wait_exit().await;

            // Not Running anymore means a deprovision owns the teardown
            let Some((process, lease)) = registry.fail_running(&id, reason) else {
                return;
            };
            drop(process);

            console.append_system(&id, format!("hypervisor exited unexpectedly: {}", reason));
            if let Some(lease) = lease {
                release_lease(&network, lease).await;
            }
            console.close(&id);
        });
    }

    /// Shut an instance down and remove it.
    ///
    /// Returns the exit reason, or `None` when another call was already
    /// deprovisioning the instance and this one only waited for it.
    /// Teardown runs on its own task and finishes even if the caller goes away.
    pub async fn deprovision(
        &self,
        id: &InstanceId,
        timeout: Option<Duration>,
    ) -> Result<Option<ExitReason>> {
        let this = self.clone();
        let id = id.clone();
        detached(async move { this.deprovision_detached(&id, timeout).await }).await
    }

    async fn deprovision_detached(
        &self,
        id: &InstanceId,
        timeout: Option<Duration>,
    ) -> Result<Option<ExitReason>> {
        let timeout = timeout.unwrap_or_else(|| self.config.default_shutdown_timeout());

        loop {
            let info = self.registry.get(id)?;
            match info.state {
                InstanceState::Running => {
                    match self.registry.transition(
                        id,
                        InstanceState::Running,
                        InstanceState::Deprovisioning,
                    ) {
                        Ok(()) => break,
                        // Lost a race with the monitor or another caller
                        Err(Error::InvalidState { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                InstanceState::Deprovisioning => {
                    self.wait_removed(id).await;
                    return Ok(None);
                }
                InstanceState::Stopped | InstanceState::Failed => {
                    return Ok(self.reap(id).await.or(info.exit_reason));
                }
                InstanceState::Provisioning => {
                    return Err(Error::InvalidState {
                        current: info.state.to_string(),
                        expected: InstanceState::Running.to_string(),
                    });
                }
            }
        }

        tracing::info!(instance = %id, timeout_ms = timeout.as_millis() as u64, "Deprovisioning instance");

        let reason = match self.registry.process(id) {
            Some(handle) => handle.shutdown(timeout).await,
            None => {
                tracing::error!(instance = %id, "Running instance has no process handle");
                ExitReason::Crashed { code: None }
            }
        };
        self.registry.set_exit_reason(id, reason);

        if let Some(lease) = self.registry.take_lease(id) {
            release_lease(&self.network, lease).await;
        }

        if let Err(e) = self.registry.update_state(id, InstanceState::Stopped) {
            tracing::error!(instance = %id, error = %e, "Failed to mark instance stopped");
        }

        self.console
            .append_system(id, format!("instance stopped: {}", reason));
        self.console.remove(id);

        if let Some(instance) = self.registry.remove(id) {
            let _ = instance.into_parts();
        }

        tracing::info!(instance = %id, reason = %reason, "Instance deprovisioned");
        Ok(Some(reason))
    }

    async fn wait_removed(&self, id: &InstanceId) {
        if let Some(mut done) = self.registry.done_signal(id) {
            let _ = done.wait_for(|d| *d).await;
        }
    }

    /// Drop a record that already finished, releasing anything left
    async fn reap(&self, id: &InstanceId) -> Option<ExitReason> {
        let instance = self.registry.remove(id)?;
        let reason = instance.exit_reason;
        let (_, lease) = instance.into_parts();
        if let Some(lease) = lease {
            release_lease(&self.network, lease).await;
        }
        self.console.remove(id);
        tracing::info!(instance = %id, "Reaped instance");
        reason
    }

    /// Deprovision every instance concurrently with the default timeout
    pub async fn drain(&self) -> DrainSummary {
        let ids: Vec<InstanceId> = self.registry.list().into_iter().map(|i| i.id).collect();
        if ids.is_empty() {
            return DrainSummary::default();
        }

        tracing::info!(count = ids.len(), "Draining instances");

        let results = join_all(ids.into_iter().map(|id| async move {
            let result = self.deprovision_settled(&id).await;
            (id, result)
        }))
        .await;

        let mut summary = DrainSummary::default();
        for (id, result) in results {
            match result {
                Ok(reason) => {
                    summary.drained += 1;
                    match reason {
                        Some(ExitReason::Clean) => summary.clean += 1,
                        Some(ExitReason::Forced) => summary.forced += 1,
                        _ => {}
                    }
                }
                // Removed by someone else in the meantime
                Err(Error::InstanceNotFound(_)) => summary.drained += 1,
                Err(e) => {
                    tracing::error!(instance = %id, error = %e, "Drain failed for instance");
                    summary.failures.push(DrainFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            drained = summary.drained,
            clean = summary.clean,
            forced = summary.forced,
            failed = summary.failures.len(),
            "Drain complete"
        );
        summary
    }

    /// Deprovision, first letting an in-flight provision finish.
    ///
    /// A provision is bounded by the launch timeout, so waiting much longer
    /// than that means it is stuck.
    async fn deprovision_settled(&self, id: &InstanceId) -> Result<Option<ExitReason>> {
        let limit = self.config.launch_timeout() + PROVISION_SETTLE_SLACK;
        let settled = tokio::time::timeout(limit, async {
            while self.registry.state(id)? == InstanceState::Provisioning {
                tokio::time::sleep(PROVISION_POLL).await;
            }
            Ok::<_, Error>(())
        })
        .await;

        match settled {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "instance {} still provisioning after {}ms",
                    id,
                    limit.as_millis()
                )))
            }
        }
        self.deprovision(id, None).await
    }

    /// Forward `host_port` on the service interface to `guest_port`
    pub async fn publish_service_port(
        &self,
        id: &InstanceId,
        host_port: u16,
        guest_port: u16,
    ) -> Result<()> {
        let info = self.registry.get(id)?;
        if info.state != InstanceState::Running {
            return Err(Error::InvalidState {
                current: info.state.to_string(),
                expected: InstanceState::Running.to_string(),
            });
        }

        let mapping = PortMapping {
            host_port,
            guest_port,
        };
        let added = {
            let network = self.network.clone();
            let owner = id.clone();
            let net_info = info.network.clone();
            blocking(move || network.publish_port(&owner, &net_info, mapping)).await?
        };

        if added {
            // The instance may have gone away meanwhile; its release dropped the rule
            let _ = self.registry.add_port(id, mapping);
        }
        Ok(())
    }

    /// Ids of all known instances, oldest first
    pub fn list_instances(&self) -> Vec<InstanceId> {
        self.registry.list().into_iter().map(|i| i.id).collect()
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.registry.list()
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<InstanceInfo> {
        self.registry.get(id)
    }

    pub fn get_logs(&self, id: &InstanceId) -> Result<Vec<LogRecord>> {
        self.registry.get(id)?;
        self.console.snapshot(id)
    }

    pub fn stream_logs(&self, id: &InstanceId) -> Result<LogSubscription> {
        self.registry.get(id)?;
        self.console.subscribe(id)
    }

    /// Resolve once the guest has reported `state`, buffered or live
    pub async fn wait_for_guest_state(
        &self,
        id: &InstanceId,
        state: &str,
        timeout: Duration,
    ) -> Result<LogRecord> {
        self.registry.get(id)?;
        let (buffered, mut subscription) = self.console.subscribe_with_snapshot(id)?;

        if let Some(record) = buffered.into_iter().find(|r| r.is_state(state)) {
            return Ok(record);
        }

        let wait = async {
            while let Some(record) = subscription.next().await {
                if record.is_state(state) {
                    return Some(record);
                }
            }
            None
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Error::InvalidState {
                current: "console closed".to_string(),
                expected: format!("guest state {}", state),
            }),
            Err(_) => Err(Error::Timeout(format!(
                "guest state {} not reported within {}ms",
                state,
                timeout.as_millis()
            ))),
        }
    }
}

/// Run `fut` on its own task so dropping the caller cannot cut it short
async fn detached<T, F>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| Error::Other(format!("lifecycle task failed: {}", e)))?
}

/// Run allocator work off the async workers
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(format!("blocking task failed: {}", e)))?
}

async fn release_lease(network: &Arc<NetworkAllocator>, lease: NetworkLease) {
    let id = lease.instance().clone();
    let network = network.clone();
    if let Err(e) = blocking(move || network.release(lease)).await {
        tracing::error!(instance = %id, error = %e, "Failed to release network lease");
    }
}
