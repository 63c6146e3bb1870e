//! VM launcher and process supervision
//!
//! A [`VmLauncher`] turns a spec plus a network lease into a running guest
//! and hands back a [`ProcessHandle`]. The handle talks to a supervisor task
//! that exclusively owns the hypervisor process: it relays shutdown and kill
//! requests, reaps the process, runs cleanup and publishes the
//! [`ExitReason`] exactly once.

mod api;
mod firecracker;
mod pidfd;

pub use api::FirecrackerApi;
pub use firecracker::FirecrackerLauncher;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::console::ConsoleWriter;
use crate::models::{ExitReason, InstanceId, InstanceSpec, NetworkInfo};
use crate::{Error, Result};

/// Upper bound on delivering the shutdown line to a wedged console
const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a launcher needs to bring one guest up
pub struct LaunchRequest {
    pub id: InstanceId,
    pub spec: InstanceSpec,
    pub network: NetworkInfo,
    /// Destination for the guest's console output
    pub console: ConsoleWriter,
}

#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Start the guest. On error nothing is left running.
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle>;
}

/// Status of an exited hypervisor process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
}

/// A started hypervisor process, driven by the supervisor task
#[async_trait]
pub trait GuestProcess: Send + 'static {
    /// Ask the guest to power off. Returns once the request is delivered.
    async fn send_shutdown(&mut self) -> Result<()>;

    /// Begin killing the process without waiting for it
    fn start_kill(&mut self) -> Result<()>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> Result<ProcessExit>;

    /// Release per-process host resources after exit
    async fn cleanup(&mut self) {}
}

#[derive(Debug)]
enum Control {
    Shutdown,
    Kill,
}

/// Shared handle to a supervised hypervisor process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: InstanceId,
    control: mpsc::Sender<Control>,
    exit: watch::Receiver<Option<ExitReason>>,
}

impl ProcessHandle {
    /// Hand `process` to a new supervisor task. Requires a tokio runtime.
    pub fn spawn(id: InstanceId, process: Box<dyn GuestProcess>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(supervise(id.clone(), process, control_rx, exit_tx));

        Self {
            id,
            control: control_tx,
            exit: exit_rx,
        }
    }

    /// Handle of a process that already exited with `reason`
    #[cfg(test)]
    pub(crate) fn exited(id: InstanceId, reason: ExitReason) -> Self {
        let (control, _) = mpsc::channel(1);
        let (_, exit) = watch::channel(Some(reason));
        Self { id, control, exit }
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Deliver the shutdown request; no-op if the process already exited
    pub async fn request_graceful_shutdown(&self) {
        let _ = self.control.send(Control::Shutdown).await;
    }

    pub async fn force_kill(&self) {
        let _ = self.control.send(Control::Kill).await;
    }

    /// Exit reason, if the process has exited and been cleaned up
    pub fn try_exit(&self) -> Option<ExitReason> {
        *self.exit.borrow()
    }

    /// Suspend until the process has exited and been cleaned up
    pub async fn wait_exit(&self) -> ExitReason {
        let mut exit = self.exit.clone();
        let reason = exit.wait_for(Option::is_some).await.map(|r| *r);
        match reason {
            Ok(Some(reason)) => reason,
            // supervisor gone without reporting
            _ => ExitReason::Crashed { code: None },
        }
    }

    /// Graceful shutdown bounded by `timeout`, escalating to a kill
    pub async fn shutdown(&self, timeout: Duration) -> ExitReason {
        if let Some(reason) = self.try_exit() {
            return reason;
        }

        self.request_graceful_shutdown().await;

        match tokio::time::timeout(timeout, self.wait_exit()).await {
            Ok(reason) => reason,
            Err(_) => {
                let err = Error::Unresponsive {
                    id: self.id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                tracing::warn!(instance = %self.id, "{}, killing", err);
                self.force_kill().await;
                self.wait_exit().await
            }
        }
    }
}

async fn supervise(
    id: InstanceId,
    mut process: Box<dyn GuestProcess>,
    mut control: mpsc::Receiver<Control>,
    exit_tx: watch::Sender<Option<ExitReason>>,
) {
    let mut shutdown_requested = false;
    let mut killed = false;
    let mut commands_open = true;

    let status = loop {
        tokio::select! {
            status = process.wait() => break status,
            command = control.recv(), if commands_open => match command {
                Some(Control::Shutdown) if !shutdown_requested && !killed => {
                    shutdown_requested = true;
                    tracing::debug!(instance = %id, "Requesting guest shutdown");
                    match tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, process.send_shutdown()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(instance = %id, error = %e, "Shutdown request failed"),
                        Err(_) => tracing::warn!(instance = %id, "Shutdown request timed out"),
                    }
                }
                Some(Control::Kill) if !killed => {
                    killed = true;
                    tracing::debug!(instance = %id, "Killing hypervisor");
                    if let Err(e) = process.start_kill() {
                        tracing::warn!(instance = %id, error = %e, "Kill failed");
                    }
                }
                Some(_) => {}
                None => {
                    // Every handle dropped, nobody can stop it later
                    commands_open = false;
                    if !killed {
                        killed = true;
                        let _ = process.start_kill();
                    }
                }
            },
        }
    };

    let reason = match status {
        Ok(_) if killed => ExitReason::Forced,
        Ok(_) if shutdown_requested => ExitReason::Clean,
        Ok(exit) => ExitReason::Crashed { code: exit.code },
        Err(e) => {
            tracing::error!(instance = %id, error = %e, "Failed to reap hypervisor");
            if killed {
                ExitReason::Forced
            } else {
                ExitReason::Crashed { code: None }
            }
        }
    };

    process.cleanup().await;

    match reason {
        ExitReason::Crashed { .. } => {
            tracing::error!(instance = %id, reason = %reason, "Hypervisor exited unexpectedly")
        }
        _ => tracing::info!(instance = %id, reason = %reason, "Hypervisor exited"),
    }

    let _ = exit_tx.send(Some(reason));
}
