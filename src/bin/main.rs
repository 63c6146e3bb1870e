//! fcnode CLI - run containers as Firecracker microVMs on this host

use clap::{Parser, Subcommand};
use fcnode::{NodeConfig, Orchestrator, Result, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "fcnode")]
#[command(about = "Single-host Firecracker microVM orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Node configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the configured listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fcnode=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&NodeConfig::default())?);
        }
        Commands::Serve { config, listen } => {
            let mut config = match config {
                Some(path) => NodeConfig::load(path)?,
                None => NodeConfig::default(),
            };
            if let Some(addr) = listen {
                config = config.listen_addr(addr);
            }

            let addr = config.listen_addr;
            let orch = Arc::new(Orchestrator::new(config)?);

            println!("Starting API server on http://{}", addr);
            println!();
            println!("Endpoints:");
            println!("  GET    /health                            Health check");
            println!("  POST   /api/v1/instances                  Provision instance");
            println!("  GET    /api/v1/instances                  List instances");
            println!("  GET    /api/v1/instances/:id              Instance detail");
            println!("  DELETE /api/v1/instances/:id              Deprovision instance");
            println!("  GET    /api/v1/instances/:id/logs         Buffered logs");
            println!("  GET    /api/v1/instances/:id/logs/stream  Live logs (SSE)");
            println!("  POST   /api/v1/instances/:id/ports        Publish service port");
            println!("  POST   /api/v1/drain                      Deprovision everything");
            println!();

            let server = Server::new(orch.clone(), addr);
            server
                .run_until(shutdown_signal())
                .await
                .map_err(|e| fcnode::Error::Other(e.to_string()))?;

            tracing::info!("Shutting down, draining instances");
            let summary = orch.drain().await;
            if !summary.failures.is_empty() {
                tracing::error!(failed = summary.failures.len(), "Some instances failed to drain");
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
