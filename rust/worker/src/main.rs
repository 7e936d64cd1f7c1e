//! Distributed data service worker.
//!
//! # Usage
//!
//! ```bash
//! # Start a worker on any free port
//! data-service-worker --dispatcher-address localhost:5050
//!
//! # Fixed port, advertised under the host name
//! data-service-worker --dispatcher-address dispatcher:5050 --port 5051 \
//!     --worker-address "$(hostname):%port%"
//!
//! # Start with configuration file
//! data-service-worker --config worker.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dataservice_core::rpc::proto::worker_service_server::WorkerServiceServer;
use dataservice_core::rpc::GrpcDispatcherClient;
use dataservice_core::WorkerConfig;
use dataservice_worker::{WorkerImpl, WorkerServiceImpl};

/// Distributed data service worker
#[derive(Parser, Debug)]
#[command(name = "data-service-worker")]
#[command(about = "Worker for the distributed data service")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Dispatcher address (host:port)
    #[arg(short, long)]
    dispatcher_address: Option<String>,

    /// Address advertised to the dispatcher; %port% is replaced with the bound port
    #[arg(short, long)]
    worker_address: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Deadline for calls to the dispatcher in milliseconds
    #[arg(long)]
    dispatcher_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_file(path)?,
            None => WorkerConfig::default(),
        }
        .with_env_overrides();

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(address) = self.dispatcher_address {
            config.dispatcher_address = address;
        }
        if let Some(address) = self.worker_address {
            config.worker_address = address;
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.heartbeat_interval_ms = interval;
        }
        if let Some(timeout) = self.dispatcher_timeout_ms {
            config.dispatcher_timeout_ms = timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.into_config()?;

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let port = listener.local_addr()?.port();
    let worker_address = config.resolved_worker_address(port);

    tracing::info!("Starting data service worker");
    tracing::info!("  Dispatcher: {}", config.dispatcher_address);
    tracing::info!("  Worker address: {}", worker_address);
    tracing::info!("  Heartbeat interval: {}ms", config.heartbeat_interval_ms);

    let dispatcher = Arc::new(GrpcDispatcherClient::new(
        &config.dispatcher_address,
        Duration::from_millis(config.dispatcher_timeout_ms),
    )?);
    let worker = Arc::new(WorkerImpl::new(config, dispatcher));

    // Serve before registering so the dispatcher can reach us with tasks
    let server = tokio::spawn(
        Server::builder()
            .add_service(WorkerServiceServer::new(WorkerServiceImpl::new(
                Arc::clone(&worker),
            )))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for CTRL+C: {}", e);
                }
                tracing::info!("Shutting down worker...");
            }),
    );

    worker.start(&worker_address).await?;
    tracing::info!("Listening on port {}", port);

    server.await??;
    worker.stop().await;
    Ok(())
}
