//! Firecracker under the jailer
//!
//! Jail layout under `{chroot_base_dir}/{exec file name}/{id}/root`:
//!
//! ```text
//! kernel.img       copied kernel
//! rootfs.ext4      per-instance copy of the root image, read-only root device
//! scratch.ext4     sparse read-write scratch drive
//! metadata.json    MMDS contents handed to the guest init
//! run/firecracker.socket
//! ```
//!
//! The jailer enters the instance's network namespace, unshares a new PID
//! namespace and exits once it has written `firecracker.pid` into the jail
//! root. Firecracker is watched through a pidfd from then on.
//!
//! The serial console is wired to the process stdio: stdout carries guest
//! output into the console multiplexer and stdin carries the shutdown line.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use super::api::{ActionType, BootSource, Drive, FirecrackerApi, MachineConfig, MmdsConfig, NetworkInterface};
use super::pidfd::Pidfd;
use super::{GuestProcess, LaunchRequest, ProcessExit, ProcessHandle, VmLauncher};
use crate::config::FirecrackerConfig;
use crate::console::ConsoleWriter;
use crate::guest;
use crate::models::{InstanceId, InstanceSpec, NetworkInfo};
use crate::{Error, Result};

const KERNEL_FILE: &str = "kernel.img";
const ROOTFS_FILE: &str = "rootfs.ext4";
const SCRATCH_FILE: &str = "scratch.ext4";
const METADATA_FILE: &str = "metadata.json";
const API_SOCKET: &str = "run/firecracker.socket";
const GUEST_IFACE: &str = "eth0";

/// Raw console lines longer than this are split
const MAX_RAW_LINE: u64 = 64 * 1024;

/// How long a killed Firecracker gets to go away during launch rollback
const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct FirecrackerLauncher {
    config: FirecrackerConfig,
}

impl FirecrackerLauncher {
    pub fn new(config: FirecrackerConfig) -> Self {
        Self { config }
    }

    fn exec_name(&self) -> OsString {
        self.config
            .firecracker_binary
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("firecracker"))
    }

    /// Directory the jailer creates for `id`; removed on teardown
    pub fn jail_dir(&self, id: &InstanceId) -> PathBuf {
        self.config
            .chroot_base_dir
            .join(self.exec_name())
            .join(id.as_str())
    }

    pub fn boot_args(&self, network: &NetworkInfo) -> String {
        let mut args = format!(
            "console=ttyS0 reboot=k panic=-1 pci=off ip={}::{}:{}::{}:off",
            network.guest_addr,
            network.gateway,
            network.netmask(),
            GUEST_IFACE
        );
        if let Some(extra) = self.config.extra_boot_args.as_deref() {
            let extra = extra.trim();
            if !extra.is_empty() {
                args.push(' ');
                args.push_str(extra);
            }
        }
        args
    }

    /// Name of the pid file the jailer leaves in the jail root
    fn pid_file(&self) -> OsString {
        let mut name = self.exec_name();
        name.push(".pid");
        name
    }

    pub fn jailer_args(&self, id: &InstanceId, uid: u32, network: &NetworkInfo) -> Vec<OsString> {
        let uid = uid.to_string();
        let mut args: Vec<OsString> = vec![
            "--id".into(),
            id.as_str().into(),
            "--exec-file".into(),
            self.config.firecracker_binary.clone().into(),
            "--uid".into(),
            uid.clone().into(),
            "--gid".into(),
            uid.into(),
            "--chroot-base-dir".into(),
            self.config.chroot_base_dir.clone().into(),
            "--netns".into(),
            network.netns_path().into(),
            "--new-pid-ns".into(),
            "--".into(),
        ];
        args.extend(
            ["--level", "error", "--metadata", METADATA_FILE]
                .iter()
                .map(OsString::from),
        );
        args
    }

    /// Populate the jail root with everything the VM opens
    async fn stage(&self, root: &Path, spec: &InstanceSpec, uid: u32) -> Result<()> {
        tokio::fs::create_dir_all(root).await?;

        let kernel = root.join(KERNEL_FILE);
        tokio::fs::copy(&self.config.kernel_image, &kernel)
            .await
            .map_err(|e| Error::launch(&format!("copy kernel {}", self.config.kernel_image.display()), e))?;

        let rootfs = root.join(ROOTFS_FILE);
        tokio::fs::copy(&self.config.rootfs, &rootfs)
            .await
            .map_err(|e| Error::launch(&format!("copy rootfs {}", self.config.rootfs.display()), e))?;

        let scratch = root.join(SCRATCH_FILE);
        let scratch_len = self
            .config
            .scratch_disk_gb
            .checked_mul(1024 * 1024 * 1024)
            .ok_or_else(|| {
                Error::Config(format!("scratch_disk_gb {} is too large", self.config.scratch_disk_gb))
            })?;
        let file = tokio::fs::File::create(&scratch).await?;
        file.set_len(scratch_len).await?;

        let metadata = root.join(METADATA_FILE);
        tokio::fs::write(&metadata, serde_json::to_vec(&mmds_metadata(spec))?).await?;

        for path in [&kernel, &rootfs, &scratch, &metadata] {
            std::os::unix::fs::chown(path, Some(uid), Some(uid))
                .map_err(|e| Error::launch(&format!("chown {}", path.display()), e))?;
        }

        Ok(())
    }

    async fn configure(&self, api: &FirecrackerApi, request: &LaunchRequest) -> Result<()> {
        api.wait_ready(Duration::from_millis(self.config.api_socket_timeout_ms))
            .await?;

        api.put_machine_config(&MachineConfig {
            vcpu_count: request.spec.vcpus,
            mem_size_mib: request.spec.memory_mb,
        })
        .await?;

        api.put_boot_source(&BootSource {
            kernel_image_path: format!("/{}", KERNEL_FILE),
            boot_args: self.boot_args(&request.network),
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "rootfs".into(),
            path_on_host: format!("/{}", ROOTFS_FILE),
            is_root_device: true,
            is_read_only: true,
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "scratch".into(),
            path_on_host: format!("/{}", SCRATCH_FILE),
            is_root_device: false,
            is_read_only: false,
        })
        .await?;

        api.put_network_interface(&NetworkInterface {
            iface_id: GUEST_IFACE.into(),
            host_dev_name: request.network.tap_name.clone(),
        })
        .await?;

        api.put_mmds_config(&MmdsConfig {
            version: "V2",
            network_interfaces: vec![GUEST_IFACE.into()],
        })
        .await?;

        api.action(ActionType::InstanceStart).await
    }
}

/// What the guest init reads from MMDS to start the container
pub fn mmds_metadata(spec: &InstanceSpec) -> serde_json::Value {
    serde_json::json!({
        "latest": {
            "container": {
                "image": spec.container_reference,
                "cmd_args": spec.cmd_args,
                "env": spec.env,
            }
        }
    })
}

async fn remove_jail(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(jail = %dir.display(), error = %e, "Failed to remove jail directory"),
    }
}

/// Undoes a partial launch unless disarmed, including when the launch
/// future is dropped mid-way
struct LaunchRollback {
    id: InstanceId,
    jail_dir: PathBuf,
    pidfd: Option<Pidfd>,
    pumps: Vec<JoinHandle<()>>,
    armed: bool,
}

impl LaunchRollback {
    fn new(id: InstanceId, jail_dir: PathBuf) -> Self {
        Self {
            id,
            jail_dir,
            pidfd: None,
            pumps: Vec::new(),
            armed: true,
        }
    }

    fn disarm(mut self) -> (Option<Pidfd>, Vec<JoinHandle<()>>) {
        self.armed = false;
        (self.pidfd.take(), std::mem::take(&mut self.pumps))
    }
}

impl Drop for LaunchRollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!(instance = %self.id, jail = %self.jail_dir.display(), "Rolling back launch");

        for pump in &self.pumps {
            pump.abort();
        }
        if let Some(pidfd) = &self.pidfd {
            if let Err(e) = pidfd.kill() {
                tracing::warn!(instance = %self.id, error = %e, "Failed to kill firecracker");
            }
        }

        let jail_dir = std::mem::take(&mut self.jail_dir);
        let pidfd = self.pidfd.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(pidfd) = pidfd {
                        let _ = tokio::time::timeout(KILL_GRACE, pidfd.exited()).await;
                    }
                    remove_jail(&jail_dir).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_dir_all(&jail_dir);
            }
        }
    }
}

#[async_trait]
impl VmLauncher for FirecrackerLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle> {
        let id = request.id.clone();
        let uid = self.config.uid_base + request.network.slot;
        let jail_dir = self.jail_dir(&id);
        let root = jail_dir.join("root");

        tracing::info!(instance = %id, uid, jail = %jail_dir.display(), "Launching firecracker");

        let mut rollback = LaunchRollback::new(id.clone(), jail_dir.clone());
        self.stage(&root, &request.spec, uid).await?;

        let mut jailer = Command::new(&self.config.jailer_binary)
            .env_clear()
            .args(self.jailer_args(&id, uid, &request.network))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::launch("spawn jailer", e))?;

        // Firecracker inherits these pipes across the jailer's fork
        let stdin = jailer.stdin.take();
        if let Some(stdout) = jailer.stdout.take() {
            rollback
                .pumps
                .push(tokio::spawn(pump_console(stdout, request.console.clone())));
        }
        if let Some(stderr) = jailer.stderr.take() {
            rollback.pumps.push(tokio::spawn(pump_stderr(stderr, id.clone())));
        }

        let pidfd = self.await_firecracker(&mut jailer, &root).await?;
        let pid = pidfd.pid();
        rollback.pidfd = Some(pidfd);

        let api = FirecrackerApi::new(root.join(API_SOCKET));
        if let Err(e) = self.configure(&api, &request).await {
            tracing::error!(instance = %id, error = %e, "Firecracker configuration failed");
            return Err(Error::launch("configure firecracker", e));
        }

        let (Some(pidfd), pumps) = rollback.disarm() else {
            return Err(Error::Launch("firecracker pidfd lost".into()));
        };
        tracing::info!(instance = %id, pid, "Firecracker started");

        let process = FirecrackerProcess {
            id: id.clone(),
            pidfd,
            stdin,
            api,
            jail_dir,
            pumps,
        };
        Ok(ProcessHandle::spawn(id, Box::new(process)))
    }
}

impl FirecrackerLauncher {
    /// Reap the jailer, then pick up the Firecracker pid it left behind
    async fn await_firecracker(&self, jailer: &mut Child, root: &Path) -> Result<Pidfd> {
        let timeout = Duration::from_millis(self.config.api_socket_timeout_ms);
        let status = tokio::time::timeout(timeout, jailer.wait())
            .await
            .map_err(|_| Error::Launch(format!("jailer still running after {}ms", timeout.as_millis())))?
            .map_err(|e| Error::launch("wait for jailer", e))?;
        if !status.success() {
            return Err(Error::Launch(format!("jailer exited with {}", status)));
        }

        let pid_file = root.join(self.pid_file());
        let raw = tokio::fs::read_to_string(&pid_file)
            .await
            .map_err(|e| Error::launch(&format!("read {}", pid_file.display()), e))?;
        let pid: i32 = raw
            .trim()
            .parse()
            .map_err(|e| Error::launch(&format!("parse {}", pid_file.display()), e))?;

        Pidfd::open(pid).map_err(|e| Error::launch("open pidfd", e))
    }
}

struct FirecrackerProcess {
    id: InstanceId,
    pidfd: Pidfd,
    stdin: Option<ChildStdin>,
    api: FirecrackerApi,
    jail_dir: PathBuf,
    pumps: Vec<JoinHandle<()>>,
}

impl FirecrackerProcess {
    async fn write_shutdown_line(&mut self) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Other("console input closed".into()))?;
        stdin.write_all(guest::SHUTDOWN_LINE).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl GuestProcess for FirecrackerProcess {
    async fn send_shutdown(&mut self) -> Result<()> {
        if let Err(e) = self.write_shutdown_line().await {
            tracing::warn!(instance = %self.id, error = %e, "Console shutdown failed, sending Ctrl+Alt+Del");
            self.api.action(ActionType::SendCtrlAltDel).await?;
        }
        Ok(())
    }

    fn start_kill(&mut self) -> Result<()> {
        self.pidfd.kill()
    }

    /// Firecracker is not our child, so its exit status is unknown
    async fn wait(&mut self) -> Result<ProcessExit> {
        self.pidfd.exited().await?;
        Ok(ProcessExit {
            code: None,
            success: false,
        })
    }

    async fn cleanup(&mut self) {
        self.stdin = None;
        // Drain whatever the guest printed last before the jail goes away
        for pump in self.pumps.drain(..) {
            if tokio::time::timeout(Duration::from_millis(500), pump).await.is_err() {
                tracing::debug!(instance = %self.id, "Console pump did not finish");
            }
        }
        remove_jail(&self.jail_dir).await;
    }
}

/// Feed serial console output into the multiplexer line by line
pub(crate) async fn pump_console<R>(reader: R, console: ConsoleWriter)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(MAX_RAW_LINE).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                console.push_line(&String::from_utf8_lossy(&buf));
            }
            Err(e) => {
                tracing::debug!(instance = %console.instance(), error = %e, "Console read failed");
                break;
            }
        }
    }
}

async fn pump_stderr<R>(reader: R, id: InstanceId)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(instance = %id, "firecracker: {}", line);
    }
}
