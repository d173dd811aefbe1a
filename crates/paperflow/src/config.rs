//! Scanning configuration and wiring of the context, pool and controller.

use paperflow_logging::LogSettings;
use paperflow_worker::process::DEFAULT_HANDSHAKE_TIMEOUT;
use paperflow_worker::{
    ChannelTimeouts, DriverRegistry, PoolInitOptions, WorkerPool, WorkerPoolConfig,
    DEFAULT_CANCEL_GRACE,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::bridge::ScanBridgeFactory;
use crate::context::ScanningContext;
use crate::controller::ScanController;
use crate::error::ScanError;
use crate::storage::FileStorageManager;

pub const ENV_STORAGE_DIR: &str = "PAPERFLOW_STORAGE_DIR";
pub const ENV_WORKER_EXE: &str = "PAPERFLOW_WORKER_EXE";
pub const ENV_WORKER_X86_EXE: &str = "PAPERFLOW_WORKER_X86_EXE";
pub const ENV_SPARE_WORKERS: &str = "PAPERFLOW_SPARE_WORKERS";
pub const ENV_RPC_TIMEOUT_SECS: &str = "PAPERFLOW_RPC_TIMEOUT_SECS";

#[derive(Debug, Clone)]
pub struct ScanningConfig {
    /// Keep pages as backing files here; `None` keeps them in memory.
    pub storage_folder: Option<PathBuf>,
    pub temp_folder: PathBuf,
    /// Native worker host; defaults to the running executable.
    pub worker_executable: Option<PathBuf>,
    pub x86_worker_executable: Option<PathBuf>,
    pub start_spare_workers: bool,
    /// Merged into every worker's environment.
    pub worker_environment: HashMap<String, String>,
    pub handshake_timeout: Duration,
    pub rpc_timeout: Option<Duration>,
    pub cancel_grace: Duration,
    /// Re-raise scan faults to the consumer of the page stream.
    pub propagate_errors: bool,
    /// Log folder and rotation, shared with workers through the
    /// `PAPERFLOW_LOG_*` variables they inherit.
    pub logging: LogSettings,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            storage_folder: None,
            temp_folder: std::env::temp_dir(),
            worker_executable: std::env::current_exe().ok(),
            x86_worker_executable: None,
            start_spare_workers: false,
            worker_environment: HashMap::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            rpc_timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            propagate_errors: false,
            logging: LogSettings::default(),
        }
    }
}

impl ScanningConfig {
    /// Defaults overridden by `PAPERFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ScanError> {
        let mut config = Self {
            logging: LogSettings::from_env()
                .map_err(|e| ScanError::Configuration(format!("{:#}", e)))?,
            ..Self::default()
        };
        if let Some(dir) = env_path(ENV_STORAGE_DIR) {
            config.storage_folder = Some(dir);
        }
        if let Some(exe) = env_path(ENV_WORKER_EXE) {
            config.worker_executable = Some(exe);
        }
        if let Some(exe) = env_path(ENV_WORKER_X86_EXE) {
            config.x86_worker_executable = Some(exe);
        }
        config.start_spare_workers = env_flag(ENV_SPARE_WORKERS);
        if let Ok(value) = std::env::var(ENV_RPC_TIMEOUT_SECS) {
            let secs = value.trim().parse::<u64>().map_err(|_| {
                ScanError::Configuration(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_RPC_TIMEOUT_SECS, value
                ))
            })?;
            config.rpc_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        Ok(config)
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            native_executable: self.worker_executable.clone(),
            x86_executable: self.x86_worker_executable.clone(),
            handshake_timeout: self.handshake_timeout,
            environment: self.worker_log_environment(),
            channel: ChannelTimeouts {
                cancel_grace: self.cancel_grace,
                rpc_timeout: self.rpc_timeout,
            },
            storage_folder: self.storage_folder.clone(),
            ..WorkerPoolConfig::default()
        }
    }

    /// Variables that carry this configuration's log settings into workers.
    /// Entries already in `worker_environment` win.
    pub fn worker_log_environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::from([
            (
                paperflow_logging::ENV_LOG_DIR.to_string(),
                self.logging
                    .dir
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|| "off".to_string()),
            ),
            (
                paperflow_logging::ENV_LOG_MAX_BYTES.to_string(),
                self.logging.max_bytes.to_string(),
            ),
            (
                paperflow_logging::ENV_LOG_KEEP.to_string(),
                self.logging.keep.to_string(),
            ),
        ]);
        env.extend(self.worker_environment.clone());
        env
    }

    pub fn scanning_context(&self) -> Result<ScanningContext, ScanError> {
        let context = match &self.storage_folder {
            Some(folder) => ScanningContext::with_file_storage(FileStorageManager::new(folder)?),
            None => ScanningContext::new(),
        };
        Ok(context.with_temp_folder(&self.temp_folder))
    }

    /// Build a controller with a worker pool. Must run inside a tokio runtime.
    pub fn build_controller(&self, drivers: DriverRegistry) -> Result<ScanController, ScanError> {
        let context = Arc::new(self.scanning_context()?);
        let pool = Arc::new(WorkerPool::new(self.worker_pool_config()));
        pool.init(PoolInitOptions {
            start_spare_workers: self.start_spare_workers,
        });
        info!(
            "[Config] storage: {}, worker: {}",
            self.storage_folder
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory".to_string()),
            self.worker_executable
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        let bridges = ScanBridgeFactory::local(drivers).with_pool(pool);
        Ok(ScanController::new(context, bridges).propagate_errors(self.propagate_errors))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim();
            value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
        }
        Err(_) => false,
    }
}
