//! Scan bridge abstractions.
//!
//! Two routes:
//! - LocalScanBridge: the driver runs in this process on the blocking pool
//! - WorkerScanBridge: the driver runs in a pooled worker process

use async_trait::async_trait;
use paperflow_protocol::{Driver, ScanDevice, ScanOptions, WorkerType};
use paperflow_worker::{CancellationToken, DriverRegistry, ScanUpdate, WorkerPool};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ScanError;

mod local;
mod worker;

pub use local::LocalScanBridge;
pub use worker::WorkerScanBridge;

/// Uniform request surface over in-process and worker-hosted drivers.
///
/// Results stream through the supplied channel; a dropped receiver stops
/// the operation. Faults are returned, never retried.
#[async_trait]
pub trait ScanBridge: Send + Sync {
    async fn get_devices(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        found: mpsc::Sender<ScanDevice>,
    ) -> Result<(), ScanError>;

    async fn scan(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        updates: mpsc::Sender<ScanUpdate>,
    ) -> Result<(), ScanError>;
}

/// Where a request's driver calls execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Worker(WorkerType),
}

impl Route {
    /// TWAIN always runs in a worker of the requested architecture;
    /// other drivers run locally unless a worker is forced.
    pub fn for_options(options: &ScanOptions) -> Route {
        if options.driver.resolve() == Driver::Twain {
            Route::Worker(options.driver_arch.worker_type())
        } else if options.use_worker {
            Route::Worker(WorkerType::Native)
        } else {
            Route::Local
        }
    }
}

/// Picks the bridge for each request.
#[derive(Clone)]
pub struct ScanBridgeFactory {
    local: Arc<LocalScanBridge>,
    pool: Option<Arc<WorkerPool>>,
}

impl ScanBridgeFactory {
    /// Factory without worker support; worker routes fail.
    pub fn local(drivers: DriverRegistry) -> Self {
        Self {
            local: Arc::new(LocalScanBridge::new(drivers)),
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    pub fn create(&self, options: &ScanOptions) -> Result<Arc<dyn ScanBridge>, ScanError> {
        match Route::for_options(options) {
            Route::Local => Ok(self.local.clone()),
            Route::Worker(worker_type) => {
                let pool = self.pool.as_ref().ok_or_else(|| {
                    ScanError::Configuration(format!(
                        "{} requires a {} worker but no worker pool is configured",
                        options.driver, worker_type
                    ))
                })?;
                Ok(Arc::new(WorkerScanBridge::new(Arc::clone(pool), worker_type)))
            }
        }
    }
}

impl std::fmt::Debug for ScanBridgeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanBridgeFactory")
            .field("local", &self.local)
            .field("pool", &self.pool)
            .finish()
    }
}
