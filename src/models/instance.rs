//! Instance model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::{Error, Result};

/// Firecracker refuses more than this many vCPUs
pub const MAX_VCPUS: u32 = 32;

/// Opaque instance identifier, generated at provision time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digits of the id with separators removed
    pub fn compact(&self) -> String {
        self.0.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Lease allocated, hypervisor being launched
    Provisioning,
    /// Hypervisor up and guest booting or running
    Running,
    /// Shutdown requested, waiting for the hypervisor to exit
    Deprovisioning,
    /// Torn down cleanly
    Stopped,
    /// Unrecoverable error
    Failed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Provisioning => write!(f, "Provisioning"),
            InstanceState::Running => write!(f, "Running"),
            InstanceState::Deprovisioning => write!(f, "Deprovisioning"),
            InstanceState::Stopped => write!(f, "Stopped"),
            InstanceState::Failed => write!(f, "Failed"),
        }
    }
}

impl InstanceState {
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Provisioning, Running) => true,
            (Running, Deprovisioning) => true,
            (Deprovisioning, Stopped) => true,
            (Provisioning | Running | Deprovisioning, Failed) => true,
            (Provisioning, _) | (Running, _) | (Deprovisioning, _) => false,
            (Stopped, _) | (Failed, _) => false,
        }
    }

    pub fn transition(self, next: InstanceState) -> Result<InstanceState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition { from: self, to: next })
        }
    }

    /// States in which a hypervisor process may exist
    pub fn is_live(self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning | InstanceState::Running | InstanceState::Deprovisioning
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

/// What to run inside the microVM. Immutable once provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub container_reference: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    #[serde(default)]
    pub cmd_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceSpec {
    pub fn builder(container_reference: impl Into<String>) -> InstanceSpecBuilder {
        InstanceSpecBuilder {
            spec: InstanceSpec {
                container_reference: container_reference.into(),
                vcpus: 1,
                memory_mb: 128,
                cmd_args: Vec::new(),
                env: BTreeMap::new(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_reference.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "container_reference cannot be empty".into(),
            ));
        }
        if self.vcpus == 0 {
            return Err(Error::InvalidArgument("vcpus must be greater than 0".into()));
        }
        if self.vcpus > MAX_VCPUS {
            return Err(Error::InvalidArgument(format!(
                "vcpus must be at most {}",
                MAX_VCPUS
            )));
        }
        if self.memory_mb == 0 {
            return Err(Error::InvalidArgument(
                "memory_mb must be greater than 0".into(),
            ));
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(Error::InvalidArgument(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InstanceSpecBuilder {
    spec: InstanceSpec,
}

impl InstanceSpecBuilder {
    pub fn vcpus(mut self, n: u32) -> Self {
        self.spec.vcpus = n;
        self
    }

    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.spec.memory_mb = mb;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.spec.cmd_args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> InstanceSpec {
        self.spec
    }

    pub fn build_validated(self) -> Result<InstanceSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// A published `host_port -> guest_port` NAT mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub guest_port: u16,
}

/// Network identity assigned to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Index of the /30 inside the node subnet
    pub slot: u32,
    pub guest_addr: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// Tap device inside `netns`, handed to Firecracker
    pub tap_name: String,
    /// Network namespace the jailer enters
    pub netns: String,
    /// Host end of the veth pair routing to `guest_addr`
    pub host_link: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

impl NetworkInfo {
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 252)
    }

    /// Bind mount created by `ip netns add`
    pub fn netns_path(&self) -> std::path::PathBuf {
        std::path::Path::new("/var/run/netns").join(&self.netns)
    }
}

/// Why a hypervisor process went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExitReason {
    /// Guest powered off after a shutdown request
    Clean,
    /// Guest ignored the shutdown request and was killed
    Forced,
    /// Process exited without being asked to
    Crashed { code: Option<i32> },
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Clean => write!(f, "clean"),
            ExitReason::Forced => write!(f, "forced"),
            ExitReason::Crashed { code: Some(code) } => write!(f, "crashed (exit code {})", code),
            ExitReason::Crashed { code: None } => write!(f, "crashed (no exit status)"),
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub state: InstanceState,
    pub spec: InstanceSpec,
    pub network: NetworkInfo,
    pub created_at: DateTime<Utc>,
    pub exit_reason: Option<ExitReason>,
}
