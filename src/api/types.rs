//! API request/response types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{InstanceInfo, InstanceSpec, LogRecord, PortMapping};

// === Instances ===

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub container_reference: String,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default = "default_memory")]
    pub memory_mb: u32,
    #[serde(default)]
    pub cmd_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_vcpus() -> u32 { 1 }
fn default_memory() -> u32 { 128 }

impl From<ProvisionRequest> for InstanceSpec {
    fn from(req: ProvisionRequest) -> Self {
        InstanceSpec {
            container_reference: req.container_reference,
            vcpus: req.vcpus,
            memory_mb: req.memory_mb,
            cmd_args: req.cmd_args,
            env: req.env,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListInstancesResponse {
    pub instances: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub id: String,
    pub state: String,
    pub container_reference: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub guest_addr: String,
    pub tap_name: String,
    pub netns: String,
    pub ports: Vec<PortMapping>,
    pub created_at: String,
    pub exit_reason: Option<String>,
}

impl From<InstanceInfo> for InstanceResponse {
    fn from(i: InstanceInfo) -> Self {
        InstanceResponse {
            id: i.id.to_string(),
            state: i.state.to_string(),
            container_reference: i.spec.container_reference,
            vcpus: i.spec.vcpus,
            memory_mb: i.spec.memory_mb,
            guest_addr: i.network.guest_addr.to_string(),
            tap_name: i.network.tap_name,
            netns: i.network.netns,
            ports: i.network.ports,
            created_at: i.created_at.to_rfc3339(),
            exit_reason: i.exit_reason.map(|r| r.to_string()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DeprovisionQuery {
    pub timeout_millis: Option<u64>,
}

// === Logs ===

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogRecord>,
}

// === Ports ===

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishPortRequest {
    pub guest_port: u16,
    pub host_port: u16,
}

// === Generic ===

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instances: usize,
}
