// rust/service-core/src/config.rs

//! Configuration for the dispatcher and worker processes.
//!
//! Both configs are parsed from TOML, then environment variable overrides are
//! applied, then the result is validated. Binaries layer CLI flags on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, ServiceError};

/// The only RPC protocol currently implemented.
pub const GRPC_PROTOCOL: &str = "grpc";

/// Placeholder in `worker_address` replaced by the port the worker bound.
pub const PORT_PLACEHOLDER: &str = "%port%";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Port to serve on.
    pub port: u16,
    // Address to bind; defaults to all interfaces on `port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatcher_address: Option<String>,
    /// Directory for the journal and the dataset store. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    /// Journal every state change and replay it on start. Requires `work_dir`.
    pub fault_tolerant_mode: bool,
    pub protocol: String,
    pub job_gc_check_interval_ms: u64,
    pub job_gc_timeout_ms: u64,
    /// Deadline applied to dispatcher-to-worker RPCs.
    pub rpc_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            port: 5050,
            dispatcher_address: None,
            work_dir: None,
            fault_tolerant_mode: false,
            protocol: GRPC_PROTOCOL.to_string(),
            job_gc_check_interval_ms: 10 * 60 * 1000,
            job_gc_timeout_ms: 5 * 60 * 1000,
            rpc_timeout_ms: 10_000,
        }
    }
}

impl FromStr for DispatcherConfig {
    type Err = ServiceError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ServiceError::config_with_source("failed to parse TOML config", e))
    }
}

impl DispatcherConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_config_file(path.as_ref())?.parse()?;
        Ok(config)
    }

    // Apply `DATA_SERVICE_DISPATCHER_*` environment overrides. Values that
    // fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        const PREFIX: &str = "DATA_SERVICE_DISPATCHER_";
        override_parsed(&mut self.port, PREFIX, "PORT");
        if let Some(val) = env_var(PREFIX, "ADDRESS") {
            self.dispatcher_address = Some(val);
        }
        if let Some(val) = env_var(PREFIX, "WORK_DIR") {
            self.work_dir = Some(PathBuf::from(val));
        }
        override_parsed(&mut self.fault_tolerant_mode, PREFIX, "FAULT_TOLERANT_MODE");
        if let Some(val) = env_var(PREFIX, "PROTOCOL") {
            self.protocol = val;
        }
        override_parsed(
            &mut self.job_gc_check_interval_ms,
            PREFIX,
            "JOB_GC_CHECK_INTERVAL_MS",
        );
        override_parsed(&mut self.job_gc_timeout_ms, PREFIX, "JOB_GC_TIMEOUT_MS");
        override_parsed(&mut self.rpc_timeout_ms, PREFIX, "RPC_TIMEOUT_MS");
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_protocol(&self.protocol)?;
        if self.fault_tolerant_mode && self.work_dir.is_none() {
            return Err(ServiceError::config(
                "fault_tolerant_mode requires work_dir to be set",
            ));
        }
        if self.job_gc_check_interval_ms == 0 {
            return Err(ServiceError::config(
                "job_gc_check_interval_ms must be greater than 0",
            ));
        }
        if self.job_gc_timeout_ms == 0 {
            return Err(ServiceError::config(
                "job_gc_timeout_ms must be greater than 0",
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ServiceError::config("rpc_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Address the dispatcher binds its RPC server to.
    pub fn bind_address(&self) -> String {
        self.dispatcher_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Port to serve on; 0 picks any free port.
    pub port: u16,
    pub dispatcher_address: String,
    /// Address the worker advertises to the dispatcher and clients.
    pub worker_address: String,
    pub protocol: String,
    pub heartbeat_interval_ms: u64,
    /// Deadline applied to worker-to-dispatcher RPCs.
    pub dispatcher_timeout_ms: u64,
    /// Fixed backoff used by the startup heartbeat and task-completion loops.
    pub retry_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            dispatcher_address: String::new(),
            worker_address: format!("localhost:{PORT_PLACEHOLDER}"),
            protocol: GRPC_PROTOCOL.to_string(),
            heartbeat_interval_ms: 30_000,
            dispatcher_timeout_ms: 60_000,
            retry_interval_ms: 5_000,
        }
    }
}

impl FromStr for WorkerConfig {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ServiceError::config_with_source("failed to parse TOML config", e))
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_config_file(path.as_ref())?.parse()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        const PREFIX: &str = "DATA_SERVICE_WORKER_";
        override_parsed(&mut self.port, PREFIX, "PORT");
        if let Some(val) = env_var(PREFIX, "DISPATCHER_ADDRESS") {
            self.dispatcher_address = val;
        }
        if let Some(val) = env_var(PREFIX, "WORKER_ADDRESS") {
            self.worker_address = val;
        }
        if let Some(val) = env_var(PREFIX, "PROTOCOL") {
            self.protocol = val;
        }
        override_parsed(&mut self.heartbeat_interval_ms, PREFIX, "HEARTBEAT_INTERVAL_MS");
        override_parsed(&mut self.dispatcher_timeout_ms, PREFIX, "DISPATCHER_TIMEOUT_MS");
        override_parsed(&mut self.retry_interval_ms, PREFIX, "RETRY_INTERVAL_MS");
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_protocol(&self.protocol)?;
        if self.dispatcher_address.is_empty() {
            return Err(ServiceError::config("dispatcher_address must not be empty"));
        }
        if self.worker_address.is_empty() {
            return Err(ServiceError::config("worker_address must not be empty"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ServiceError::config(
                "heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.dispatcher_timeout_ms == 0 {
            return Err(ServiceError::config(
                "dispatcher_timeout_ms must be greater than 0",
            ));
        }
        if self.retry_interval_ms == 0 {
            return Err(ServiceError::config(
                "retry_interval_ms must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Worker address with the `%port%` placeholder replaced by `port`.
    pub fn resolved_worker_address(&self, port: u16) -> String {
        self.worker_address
            .replace(PORT_PLACEHOLDER, &port.to_string())
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| ServiceError::storage_with_source(path, "failed to read config file", e))
}

fn validate_protocol(protocol: &str) -> Result<()> {
    if protocol != GRPC_PROTOCOL {
        return Err(ServiceError::config(format!(
            "unsupported protocol '{protocol}', must be '{GRPC_PROTOCOL}'"
        )));
    }
    Ok(())
}

fn env_var(prefix: &str, name: &str) -> Option<String> {
    std::env::var(format!("{prefix}{name}")).ok()
}

fn override_parsed<T: FromStr>(field: &mut T, prefix: &str, name: &str) {
    if let Some(val) = env_var(prefix, name) {
        if let Ok(v) = val.parse() {
            *field = v;
        }
    }
}
