//! Distributed data service dispatcher.
//!
//! # Usage
//!
//! ```bash
//! # Start a dispatcher with default settings
//! data-service-dispatcher
//!
//! # Fault tolerant dispatcher keeping its journal under /var/lib/dataservice
//! data-service-dispatcher --work-dir /var/lib/dataservice --fault-tolerant-mode
//!
//! # Start with configuration file
//! data-service-dispatcher --config dispatcher.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dataservice_core::rpc::proto::dispatcher_service_server::DispatcherServiceServer;
use dataservice_core::rpc::GrpcWorkerClientFactory;
use dataservice_core::DispatcherConfig;
use dataservice_dispatcher::{DispatcherImpl, DispatcherServiceImpl};

/// Distributed data service dispatcher
#[derive(Parser, Debug)]
#[command(name = "data-service-dispatcher")]
#[command(about = "Dispatcher for the distributed data service")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to, overriding the port
    #[arg(short, long)]
    address: Option<String>,

    /// Directory for dataset files and the journal
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Journal state changes and restore them on restart
    #[arg(long)]
    fault_tolerant_mode: bool,

    /// How often to look for jobs to garbage collect, in milliseconds
    #[arg(long)]
    job_gc_check_interval_ms: Option<u64>,

    /// How long a job may go without clients before it is garbage collected
    #[arg(long)]
    job_gc_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<DispatcherConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => DispatcherConfig::from_file(path)?,
            None => DispatcherConfig::default(),
        }
        .with_env_overrides();

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(address) = self.address {
            config.dispatcher_address = Some(address);
        }
        if let Some(work_dir) = self.work_dir {
            config.work_dir = Some(work_dir);
        }
        if self.fault_tolerant_mode {
            config.fault_tolerant_mode = true;
        }
        if let Some(interval) = self.job_gc_check_interval_ms {
            config.job_gc_check_interval_ms = interval;
        }
        if let Some(timeout) = self.job_gc_timeout_ms {
            config.job_gc_timeout_ms = timeout;
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
    let addr: SocketAddr = config.bind_address().parse()?;

    tracing::info!("Starting data service dispatcher");
    tracing::info!("  Work dir: {:?}", config.work_dir);
    tracing::info!("  Fault tolerant mode: {}", config.fault_tolerant_mode);
    tracing::info!("  Job GC check interval: {}ms", config.job_gc_check_interval_ms);
    tracing::info!("  Job GC timeout: {}ms", config.job_gc_timeout_ms);

    let worker_clients = Arc::new(GrpcWorkerClientFactory::new(Duration::from_millis(
        config.rpc_timeout_ms,
    )));
    let dispatcher = Arc::new(DispatcherImpl::new(config, worker_clients)?);
    dispatcher.start().await?;

    tracing::info!("Listening on {}", addr);

    Server::builder()
        .add_service(DispatcherServiceServer::new(DispatcherServiceImpl::new(
            Arc::clone(&dispatcher),
        )))
        .serve_with_shutdown(addr, async {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for CTRL+C: {}", e);
                    }
                }
                e = dispatcher.wait_for_journal_failure() => {
                    tracing::error!("{}", e);
                }
            }
            tracing::info!("Shutting down dispatcher...");
        })
        .await?;

    dispatcher.shutdown().await;
    match dispatcher.journal_failure() {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
