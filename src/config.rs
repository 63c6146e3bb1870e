//! Node configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Largest scratch drive a jail may be given
pub const MAX_SCRATCH_DISK_GB: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the HTTP API binds to
    pub listen_addr: SocketAddr,
    pub firecracker: FirecrackerConfig,
    pub network: NetworkConfig,
    pub shutdown: ShutdownConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub jailer_binary: PathBuf,
    pub firecracker_binary: PathBuf,
    pub kernel_image: PathBuf,
    /// Guest root filesystem, copied into every jail
    pub rootfs: PathBuf,
    pub chroot_base_dir: PathBuf,
    /// Each VM runs as `uid_base + slot`
    pub uid_base: u32,
    /// Size of the sparse read-write scratch drive
    pub scratch_disk_gb: u64,
    /// Appended to the kernel command line
    pub extra_boot_args: Option<String>,
    /// How long to wait for the API socket to appear after spawn
    pub api_socket_timeout_ms: u64,
    /// Upper bound on a whole launch, from jail staging to InstanceStart
    pub launch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub subnet_base: Ipv4Addr,
    pub prefix_len: u8,
    /// Host interface that carries guest egress and published ports
    pub service_interface: String,
    /// Log host network commands instead of running them
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Graceful shutdown window before the hypervisor is killed
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub buffer_lines: usize,
    pub buffer_bytes: usize,
    /// Records a subscriber may fall behind before the oldest are dropped
    pub subscriber_queue: usize,
    pub max_line_length: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            firecracker: FirecrackerConfig::default(),
            network: NetworkConfig::default(),
            shutdown: ShutdownConfig::default(),
            console: ConsoleConfig::default(),
        }
    }
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            jailer_binary: PathBuf::from("/usr/local/bin/jailer"),
            firecracker_binary: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_image: PathBuf::from("/var/lib/fcnode/vmlinux"),
            rootfs: PathBuf::from("/var/lib/fcnode/rootfs.ext4"),
            chroot_base_dir: PathBuf::from("/srv/jailer"),
            uid_base: 10000,
            scratch_disk_gb: 8,
            extra_boot_args: None,
            api_socket_timeout_ms: 2000,
            launch_timeout_ms: 30_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet_base: Ipv4Addr::new(172, 16, 0, 0),
            prefix_len: 16,
            service_interface: "eth0".to_string(),
            dry_run: false,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3000,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            buffer_lines: 1000,
            buffer_bytes: 1024 * 1024,
            subscriber_queue: 128,
            max_line_length: 8 * 1024,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("unable to read {}: {}", path.display(), e))
        })?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        if self.shutdown.default_timeout_ms == 0 {
            return Err(Error::Config("shutdown.default_timeout_ms must be > 0".into()));
        }
        if self.console.buffer_lines == 0 || self.console.buffer_bytes == 0 {
            return Err(Error::Config("console buffer bounds must be > 0".into()));
        }
        if self.console.subscriber_queue == 0 {
            return Err(Error::Config("console.subscriber_queue must be > 0".into()));
        }
        if self.console.max_line_length < 64 {
            return Err(Error::Config("console.max_line_length must be >= 64".into()));
        }
        if self.firecracker.api_socket_timeout_ms == 0 {
            return Err(Error::Config("firecracker.api_socket_timeout_ms must be > 0".into()));
        }
        if self.firecracker.launch_timeout_ms == 0 {
            return Err(Error::Config("firecracker.launch_timeout_ms must be > 0".into()));
        }
        if !(1..=MAX_SCRATCH_DISK_GB).contains(&self.firecracker.scratch_disk_gb) {
            return Err(Error::Config(format!(
                "firecracker.scratch_disk_gb must be between 1 and {}",
                MAX_SCRATCH_DISK_GB
            )));
        }
        Ok(())
    }

    pub fn default_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.default_timeout_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.firecracker.launch_timeout_ms)
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_subnet(mut self, base: Ipv4Addr, prefix_len: u8) -> Self {
        self.network.subnet_base = base;
        self.network.prefix_len = prefix_len;
        self
    }

    pub fn with_service_interface(mut self, name: impl Into<String>) -> Self {
        self.network.service_interface = name.into();
        self
    }

    pub fn with_dry_run_network(mut self, dry_run: bool) -> Self {
        self.network.dry_run = dry_run;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.firecracker.launch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_console_buffer(mut self, lines: usize, bytes: usize) -> Self {
        self.console.buffer_lines = lines;
        self.console.buffer_bytes = bytes;
        self
    }

    pub fn with_subscriber_queue(mut self, n: usize) -> Self {
        self.console.subscriber_queue = n;
        self
    }
}

impl NetworkConfig {
    /// Number of /30 slots that fit in the subnet
    pub fn slot_count(&self) -> u32 {
        if self.prefix_len > 30 {
            return 0;
        }
        1u32 << (30 - self.prefix_len as u32)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix_len > 30 {
            return Err(Error::Config(format!(
                "network.prefix_len /{} leaves no room for a /30 slot",
                self.prefix_len
            )));
        }
        if self.prefix_len < 8 {
            return Err(Error::Config(format!(
                "network.prefix_len /{} is too large a subnet",
                self.prefix_len
            )));
        }
        let base = u32::from(self.subnet_base);
        let host_bits = 32 - self.prefix_len as u32;
        if base & ((1u32 << host_bits) - 1) != 0 {
            return Err(Error::Config(format!(
                "network.subnet_base {} is not aligned to /{}",
                self.subnet_base, self.prefix_len
            )));
        }
        if self.service_interface.is_empty() {
            return Err(Error::Config("network.service_interface cannot be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.network.slot_count(), 16384);
    }

    #[test]
    fn test_slot_count() {
        let mut net = NetworkConfig::default();
        net.prefix_len = 28;
        assert_eq!(net.slot_count(), 4);
        net.prefix_len = 30;
        assert_eq!(net.slot_count(), 1);
        net.prefix_len = 31;
        assert_eq!(net.slot_count(), 0);
    }

    #[test]
    fn test_rejects_unaligned_subnet() {
        let config = NodeConfig::new().with_subnet(Ipv4Addr::new(10, 0, 0, 4), 28);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let config = NodeConfig::new().with_shutdown_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scratch_disk_bounds() {
        let mut config = NodeConfig::new();
        config.firecracker.scratch_disk_gb = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.firecracker.scratch_disk_gb = MAX_SCRATCH_DISK_GB;
        assert!(config.validate().is_ok());

        config.firecracker.scratch_disk_gb = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_launch_timeout() {
        let config = NodeConfig::new().with_launch_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
        assert_eq!(NodeConfig::new().launch_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"network": {{"subnet_base": "10.20.0.0", "prefix_len": 24}}, "shutdown": {{"default_timeout_ms": 500}}}}"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.network.subnet_base, Ipv4Addr::new(10, 20, 0, 0));
        assert_eq!(config.network.prefix_len, 24);
        assert_eq!(config.network.service_interface, "eth0");
        assert_eq!(config.shutdown.default_timeout_ms, 500);
        assert_eq!(config.console.buffer_lines, 1000);
    }

    #[test]
    fn test_load_empty_object() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        assert!(NodeConfig::load(file.path()).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let result = NodeConfig::load("/nonexistent/fcnode.json");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
