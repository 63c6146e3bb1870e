//! Minimal Firecracker API client over the jail's unix socket

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;

use crate::{Error, Result};

#[derive(Debug, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[derive(Debug, Serialize)]
pub struct MmdsConfig {
    pub version: &'static str,
    pub network_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
}

#[derive(Debug, Serialize)]
struct InstanceAction {
    action_type: ActionType,
}

/// Client bound to one VM's API socket. Opens a connection per request.
#[derive(Debug, Clone)]
pub struct FirecrackerApi {
    socket: PathBuf,
}

impl FirecrackerApi {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Poll until the socket file shows up
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.socket.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Firecracker(format!(
                    "API socket {} did not appear within {}ms",
                    self.socket.display(),
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    pub async fn put_boot_source(&self, boot: &BootSource) -> Result<()> {
        self.put("/boot-source", boot).await
    }

    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    pub async fn put_mmds_config(&self, config: &MmdsConfig) -> Result<()> {
        self.put("/mmds/config", config).await
    }

    pub async fn action(&self, action_type: ActionType) -> Result<()> {
        self.put("/actions", &InstanceAction { action_type }).await
    }

    async fn put<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let body = serde_json::to_vec(body)?;
        tracing::trace!(socket = %self.socket.display(), "PUT {}", path);

        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Firecracker(format!("handshake: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Firecracker API connection closed: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header("Host", "localhost")
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Firecracker(format!("{}: {}", path, e)))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Firecracker(format!("{}: {}", path, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();

        Err(Error::Firecracker(format!(
            "PUT {} returned {}: {}",
            path,
            status,
            detail.trim()
        )))
    }
}
