//! Instance registry
//!
//! The single owner of instance records. Every mutation happens under one
//! write lock, so readers never see a half-applied update and `list()`
//! is a consistent snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::launcher::ProcessHandle;
use crate::models::{
    ExitReason, InstanceId, InstanceInfo, InstanceSpec, InstanceState, NetworkInfo, PortMapping,
};
use crate::network::NetworkLease;
use crate::{Error, Result};

/// Internal record; owns the process handle and the network lease
#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub state: InstanceState,
    pub spec: InstanceSpec,
    pub network: NetworkInfo,
    pub created_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
    process: Option<ProcessHandle>,
    lease: Option<NetworkLease>,
    /// Flips to true (or drops) once teardown is finished
    done: watch::Sender<bool>,
}

impl Instance {
    /// New record in `Provisioning`, holding its lease
    pub fn new(id: InstanceId, spec: InstanceSpec, lease: NetworkLease) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            network: lease.info().clone(),
            id,
            state: InstanceState::Provisioning,
            spec,
            created_at: Utc::now(),
            exit_reason: None,
            process: None,
            lease: Some(lease),
            done,
        }
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            state: self.state,
            spec: self.spec.clone(),
            network: self.network.clone(),
            created_at: self.created_at,
            exit_reason: self.exit_reason,
        }
    }

    /// Remaining resources, handed back when the record is dropped from the table
    pub fn into_parts(self) -> (Option<ProcessHandle>, Option<NetworkLease>) {
        let _ = self.done.send(true);
        (self.process, self.lease)
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    instances: Arc<RwLock<HashMap<InstanceId, Instance>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; a duplicate id hands the record back untouched
    pub fn insert(&self, instance: Instance) -> std::result::Result<(), Instance> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.id) {
            return Err(instance);
        }
        tracing::debug!(instance = %instance.id, "Registered instance");
        instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn get(&self, id: &InstanceId) -> Result<InstanceInfo> {
        self.instances
            .read()
            .get(id)
            .map(Instance::info)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    pub fn state(&self, id: &InstanceId) -> Result<InstanceState> {
        self.instances
            .read()
            .get(id)
            .map(|i| i.state)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.read().contains_key(id)
    }

    /// All instances, oldest first
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut list: Vec<InstanceInfo> = self.instances.read().values().map(Instance::info).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Move to `to` along a legal edge of the state machine
    pub fn update_state(&self, id: &InstanceId, to: InstanceState) -> Result<InstanceState> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;

        let from = instance.state;
        instance.state = from.transition(to)?;
        tracing::info!(instance = %id, from = %from, to = %to, "State transition");
        Ok(from)
    }

    /// Compare-and-set: move `from -> to` only if the instance is still in `from`
    pub fn transition(&self, id: &InstanceId, from: InstanceState, to: InstanceState) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;

        if instance.state != from {
            return Err(Error::InvalidState {
                current: instance.state.to_string(),
                expected: from.to_string(),
            });
        }
        instance.state = from.transition(to)?;
        tracing::info!(instance = %id, from = %from, to = %to, "State transition");
        Ok(())
    }

    pub fn attach_process(&self, id: &InstanceId, process: ProcessHandle) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        instance.process = Some(process);
        Ok(())
    }

    pub fn process(&self, id: &InstanceId) -> Option<ProcessHandle> {
        self.instances.read().get(id).and_then(|i| i.process.clone())
    }

    pub fn take_lease(&self, id: &InstanceId) -> Option<NetworkLease> {
        self.instances.write().get_mut(id).and_then(|i| i.lease.take())
    }

    pub fn set_exit_reason(&self, id: &InstanceId, reason: ExitReason) {
        if let Some(instance) = self.instances.write().get_mut(id) {
            instance.exit_reason = Some(reason);
        }
    }

    /// Running -> Failed after an unrequested exit, taking the process handle
    /// and the lease in the same step. `None` if the instance is no longer
    /// `Running`, in which case whoever moved it owns the teardown.
    pub fn fail_running(
        &self,
        id: &InstanceId,
        reason: ExitReason,
    ) -> Option<(Option<ProcessHandle>, Option<NetworkLease>)> {
        let mut instances = self.instances.write();
        let instance = instances.get_mut(id)?;
        if instance.state != InstanceState::Running {
            return None;
        }
        instance.state = InstanceState::Failed;
        instance.exit_reason = Some(reason);
        tracing::warn!(instance = %id, reason = %reason, "Instance failed");
        Some((instance.process.take(), instance.lease.take()))
    }

    pub fn add_port(&self, id: &InstanceId, mapping: PortMapping) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
        if !instance.network.ports.contains(&mapping) {
            instance.network.ports.push(mapping);
            instance.network.ports.sort();
        }
        Ok(())
    }

    /// Resolves once the instance has been removed
    pub fn done_signal(&self, id: &InstanceId) -> Option<watch::Receiver<bool>> {
        self.instances.read().get(id).map(|i| i.done.subscribe())
    }

    pub fn remove(&self, id: &InstanceId) -> Option<Instance> {
        let removed = self.instances.write().remove(id);
        if removed.is_some() {
            tracing::debug!(instance = %id, "Removed instance");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::{DryRunNetwork, NetworkAllocator};

    fn allocator() -> NetworkAllocator {
        NetworkAllocator::new(NetworkConfig::default(), Arc::new(DryRunNetwork))
    }

    fn instance(alloc: &NetworkAllocator) -> Instance {
        let id = InstanceId::generate();
        let lease = alloc.allocate(&id).unwrap();
        Instance::new(id, InstanceSpec::builder("nginx").build(), lease)
    }

    #[test]
    fn test_insert_get_remove() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();

        registry.insert(inst).unwrap();
        let info = registry.get(&id).unwrap();
        assert_eq!(info.state, InstanceState::Provisioning);
        assert_eq!(info.network.slot, 0);

        let removed = registry.remove(&id).unwrap();
        let (_, lease) = removed.into_parts();
        alloc.release(lease.unwrap()).unwrap();

        assert!(matches!(registry.get(&id), Err(Error::InstanceNotFound(_))));
        assert!(registry.remove(&id).is_none());
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();
        registry.insert(inst).unwrap();

        registry.update_state(&id, InstanceState::Running).unwrap();
        registry
            .transition(&id, InstanceState::Running, InstanceState::Deprovisioning)
            .unwrap();

        // Second caller loses the race
        let err = registry
            .transition(&id, InstanceState::Running, InstanceState::Deprovisioning)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(registry.state(&id).unwrap(), InstanceState::Deprovisioning);
    }

    #[test]
    fn test_illegal_update_rejected() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();
        registry.insert(inst).unwrap();

        let err = registry.update_state(&id, InstanceState::Stopped).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn test_fail_running_takes_process_and_lease_once() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();
        registry.insert(inst).unwrap();

        // Not running yet
        assert!(registry.fail_running(&id, ExitReason::Crashed { code: Some(1) }).is_none());

        registry.update_state(&id, InstanceState::Running).unwrap();
        registry
            .attach_process(&id, ProcessHandle::exited(id.clone(), ExitReason::Crashed { code: Some(1) }))
            .unwrap();
        let (process, lease) = registry
            .fail_running(&id, ExitReason::Crashed { code: Some(1) })
            .unwrap();
        assert!(process.is_some());
        assert!(lease.is_some());
        assert!(registry.process(&id).is_none());
        assert!(registry.take_lease(&id).is_none());
        assert!(registry.fail_running(&id, ExitReason::Crashed { code: Some(1) }).is_none());

        let info = registry.get(&id).unwrap();
        assert_eq!(info.state, InstanceState::Failed);
        assert_eq!(info.exit_reason, Some(ExitReason::Crashed { code: Some(1) }));
    }

    #[test]
    fn test_list_is_sorted_snapshot() {
        let alloc = allocator();
        let registry = Registry::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let inst = instance(&alloc);
            ids.push(inst.id.clone());
            registry.insert(inst).unwrap();
        }

        let list = registry.list();
        assert_eq!(list.len(), 5);
        for pair in list.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        assert_eq!(registry.len(), 5);
    }

    #[tokio::test]
    async fn test_done_signal_fires_on_teardown() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();
        registry.insert(inst).unwrap();

        let mut done = registry.done_signal(&id).unwrap();
        let waiter = tokio::spawn(async move {
            let _ = done.wait_for(|d| *d).await;
        });

        let removed = registry.remove(&id).unwrap();
        let _ = removed.into_parts();
        waiter.await.unwrap();
    }

    #[test]
    fn test_add_port_dedupes() {
        let alloc = allocator();
        let registry = Registry::new();
        let inst = instance(&alloc);
        let id = inst.id.clone();
        registry.insert(inst).unwrap();

        let mapping = PortMapping { host_port: 8080, guest_port: 80 };
        registry.add_port(&id, mapping).unwrap();
        registry.add_port(&id, mapping).unwrap();
        assert_eq!(registry.get(&id).unwrap().network.ports, vec![mapping]);
    }
}
