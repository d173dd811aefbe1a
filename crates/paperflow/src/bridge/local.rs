use async_trait::async_trait;
use paperflow_protocol::{ScanDevice, ScanOptions};
use paperflow_worker::{CancellationToken, DriverError, DriverRegistry, ScanUpdate, UpdateSink};
use tokio::sync::mpsc;
use tracing::debug;

use super::ScanBridge;
use crate::error::ScanError;

/// Runs drivers in this process.
#[derive(Debug, Clone)]
pub struct LocalScanBridge {
    drivers: DriverRegistry,
}

impl LocalScanBridge {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self { drivers }
    }
}

fn join_fault(err: tokio::task::JoinError) -> ScanError {
    ScanError::Driver(DriverError::Fault(format!("driver task failed: {}", err)))
}

#[async_trait]
impl ScanBridge for LocalScanBridge {
    async fn get_devices(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        found: mpsc::Sender<ScanDevice>,
    ) -> Result<(), ScanError> {
        let driver = self.drivers.get(options.driver)?;
        let options = options.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            driver.get_devices(&options, &cancel, &mut |device| {
                let _ = found.blocking_send(device);
            })
        })
        .await
        .map_err(join_fault)??;
        Ok(())
    }

    async fn scan(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        updates: mpsc::Sender<ScanUpdate>,
    ) -> Result<(), ScanError> {
        let driver = self.drivers.get(options.driver)?;
        let options = options.clone();
        let cancel = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut sink = UpdateSink::new(updates);
            driver.scan(&options, &cancel, &mut sink)
        })
        .await
        .map_err(join_fault)?;

        match outcome {
            Ok(()) => Ok(()),
            Err(DriverError::Disconnected) => {
                debug!("[Scan] Consumer stopped listening");
                Ok(())
            }
            Err(fault) => Err(fault.into()),
        }
    }
}
