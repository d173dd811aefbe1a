use async_trait::async_trait;
use paperflow_protocol::{ScanDevice, ScanOptions, WorkerType};
use paperflow_worker::{CancellationToken, ScanUpdate, WorkerPool};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ScanBridge;
use crate::error::ScanError;

/// Runs drivers inside a freshly leased worker process.
///
/// Each call leases its own worker and disposes it afterwards, so one
/// worker never serves two requests.
#[derive(Debug, Clone)]
pub struct WorkerScanBridge {
    pool: Arc<WorkerPool>,
    worker_type: WorkerType,
}

impl WorkerScanBridge {
    pub fn new(pool: Arc<WorkerPool>, worker_type: WorkerType) -> Self {
        Self { pool, worker_type }
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }
}

#[async_trait]
impl ScanBridge for WorkerScanBridge {
    async fn get_devices(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        found: mpsc::Sender<ScanDevice>,
    ) -> Result<(), ScanError> {
        let mut worker = self.pool.create(self.worker_type).await?;
        let pid = worker.pid();
        debug!("[Worker {}] Enumerating {} devices", pid, options.driver);
        let result = worker.service().get_device_list(options, cancel, &found).await;
        worker.dispose().await;
        if let Err(e) = &result {
            warn!("[Worker {}] Enumeration failed: {}", pid, e);
        }
        Ok(result?)
    }

    async fn scan(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        updates: mpsc::Sender<ScanUpdate>,
    ) -> Result<(), ScanError> {
        let mut worker = self.pool.create(self.worker_type).await?;
        let pid = worker.pid();
        debug!("[Worker {}] Scanning", pid);
        let result = worker.service().scan(options, cancel, &updates).await;
        worker.dispose().await;
        if let Err(e) = &result {
            warn!("[Worker {}] Scan failed: {}", pid, e);
        }
        Ok(result?)
    }
}
