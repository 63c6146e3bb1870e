//! Firecracker node orchestrator
//!
//! Runs OCI container workloads as single-purpose Firecracker microVMs on
//! one Linux host and exposes their lifecycle over an HTTP/JSON API.
//!
//! # Components
//!
//! - **Network allocator** - one /30 per guest, tap device, NAT and
//!   published ports on the service interface
//! - **Console multiplexer** - bounded per-instance log buffer with
//!   live fan-out to subscribers
//! - **Launcher** - jailed Firecracker processes under a supervisor task
//! - **Orchestrator** - the per-instance state machine tying it together
//!
//! # Example
//!
//! ```no_run
//! use fcnode::{InstanceSpec, NodeConfig, Orchestrator};
//!
//! # async fn run() -> fcnode::Result<()> {
//! let orchestrator = Orchestrator::new(NodeConfig::load("/etc/fcnode/node.json")?)?;
//!
//! let spec = InstanceSpec::builder("docker.io/library/nginx:latest")
//!     .vcpus(1)
//!     .memory_mb(128)
//!     .build();
//!
//! let id = orchestrator.provision(spec).await?;
//! orchestrator.publish_service_port(&id, 8080, 80).await?;
//!
//! // ...
//!
//! orchestrator.deprovision(&id, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod console;
pub mod error;
pub mod guest;
pub mod launcher;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod registry;

pub use api::Server;
pub use config::NodeConfig;
pub use error::{Error, ErrorKind, Result};
pub use models::{ExitReason, InstanceId, InstanceInfo, InstanceSpec, InstanceState, LogRecord, LogType};
pub use orchestrator::{DrainSummary, Orchestrator};
