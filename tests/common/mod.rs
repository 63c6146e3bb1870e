//! Shared fixtures: a scripted guest that speaks the console protocol

#![allow(dead_code)]

use async_trait::async_trait;
use fcnode::console::ConsoleWriter;
use fcnode::launcher::{GuestProcess, LaunchRequest, ProcessExit, ProcessHandle, VmLauncher};
use fcnode::{Error, InstanceId, InstanceState, NodeConfig, Orchestrator, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Console output of a guest that boots and starts its container
pub const BOOT_SCRIPT: &[&str] = &[
    "[    0.000000] Linux version 6.1.102 (fcnode-test)",
    "##fcnode:state:booted",
    "##fcnode:state:pulling-image",
    "##fcnode:state:container-started",
    "ready for connections",
];

struct FakeGuest {
    console: ConsoleWriter,
    honors_shutdown: bool,
    kills: Arc<AtomicUsize>,
    exits: mpsc::UnboundedSender<ProcessExit>,
    exited: mpsc::UnboundedReceiver<ProcessExit>,
}

#[async_trait]
impl GuestProcess for FakeGuest {
    async fn send_shutdown(&mut self) -> Result<()> {
        self.console.push_line("##fcnode:state:shutting-down");
        if self.honors_shutdown {
            let _ = self.exits.send(ProcessExit { code: Some(0), success: true });
        }
        Ok(())
    }

    fn start_kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let _ = self.exits.send(ProcessExit { code: None, success: false });
        Ok(())
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        self.exited
            .recv()
            .await
            .ok_or_else(|| Error::Other("fake guest channel closed".into()))
    }
}

/// Launcher producing [`FakeGuest`]s; tests steer guests by instance id
#[derive(Default)]
pub struct FakeLauncher {
    ignore_shutdown: AtomicBool,
    fail_launch: AtomicBool,
    hang_launch: AtomicBool,
    launch_delay: Mutex<Option<Duration>>,
    launches: AtomicUsize,
    kills: Arc<AtomicUsize>,
    exits: Mutex<HashMap<InstanceId, mpsc::UnboundedSender<ProcessExit>>>,
    consoles: Mutex<HashMap<InstanceId, ConsoleWriter>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Guests that never power off on request
    pub fn unresponsive() -> Arc<Self> {
        let launcher = Self::default();
        launcher.ignore_shutdown.store(true, Ordering::SeqCst);
        Arc::new(launcher)
    }

    pub fn failing() -> Arc<Self> {
        let launcher = Self::default();
        launcher.fail_launch.store(true, Ordering::SeqCst);
        Arc::new(launcher)
    }

    /// Launches that never finish on their own
    pub fn hanging() -> Arc<Self> {
        let launcher = Self::default();
        launcher.hang_launch.store(true, Ordering::SeqCst);
        Arc::new(launcher)
    }

    /// Launches that take `delay` before the guest boots
    pub fn slow(delay: Duration) -> Arc<Self> {
        let launcher = Self::default();
        *launcher.launch_delay.lock() = Some(delay);
        Arc::new(launcher)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Make the hypervisor of `id` exit on its own
    pub fn crash(&self, id: &InstanceId, code: i32) {
        if let Some(tx) = self.exits.lock().get(id) {
            let _ = tx.send(ProcessExit { code: Some(code), success: false });
        }
    }

    /// Write a raw console line as if the guest printed it
    pub fn emit(&self, id: &InstanceId, line: &str) {
        if let Some(console) = self.consoles.lock().get(id) {
            console.push_line(line);
        }
    }
}

#[async_trait]
impl VmLauncher for FakeLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<ProcessHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(Error::Firecracker("PUT /actions returned 400 Bad Request".into()));
        }
        if self.hang_launch.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = *self.launch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        for line in BOOT_SCRIPT {
            request.console.push_line(line);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.exits.lock().insert(request.id.clone(), tx.clone());
        self.consoles
            .lock()
            .insert(request.id.clone(), request.console.clone());

        let guest = FakeGuest {
            console: request.console,
            honors_shutdown: !self.ignore_shutdown.load(Ordering::SeqCst),
            kills: self.kills.clone(),
            exits: tx,
            exited: rx,
        };
        Ok(ProcessHandle::spawn(request.id, Box::new(guest)))
    }
}

/// Node config with host networking disabled and `prefix_len` sized subnet
pub fn test_config(prefix_len: u8) -> NodeConfig {
    NodeConfig::new()
        .with_subnet(Ipv4Addr::new(172, 31, 0, 0), prefix_len)
        .with_service_interface("eno1")
        .with_dry_run_network(true)
}

pub fn orchestrator(launcher: Arc<FakeLauncher>) -> Arc<Orchestrator> {
    orchestrator_with(launcher, test_config(24))
}

pub fn orchestrator_with(launcher: Arc<FakeLauncher>, config: NodeConfig) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::with_launcher(config, launcher).unwrap())
}

/// Serve the API on an ephemeral port
pub async fn serve(orch: Arc<Orchestrator>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = fcnode::api::router(orch);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Poll until the instance reaches `state` or disappears
pub async fn wait_for_state(orch: &Orchestrator, id: &InstanceId, state: InstanceState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match orch.get_instance(id) {
                Ok(info) if info.state == state => return,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => panic!("instance {} vanished: {}", id, e),
            }
        }
    })
    .await
    .expect("state not reached in time");
}
