//! Driver abstraction shared by in-process scanning and worker hosts.
//!
//! Driver SDKs are blocking, so the trait is synchronous; callers run it on
//! the blocking thread pool and receive results as [`ScanUpdate`]s.

use paperflow_protocol::{Driver, ImagePayload, ScanDevice, ScanOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;
use crate::error::DriverError;
use crate::sim::SimulatedDriver;

/// One step of a running scan, in device order.
#[derive(Debug, Clone)]
pub enum ScanUpdate {
    PageStart,
    Progress(f64),
    Page(ImagePayload),
}

/// Receives the events of a running scan.
pub trait ScanEventSink: Send {
    fn page_start(&mut self);

    /// Progress of the current page in `0.0..=1.0`.
    fn page_progress(&mut self, progress: f64);

    /// A completed page. An error means nobody is listening any more.
    fn page(&mut self, image: ImagePayload) -> Result<(), DriverError>;
}

/// Platform-agnostic scanner driver.
///
/// Implementations check `cancel` between pages; an in-flight page is
/// never interrupted.
pub trait ScanDriver: Send + Sync {
    fn driver(&self) -> Driver;

    /// Enumerate devices, reporting each one as it is found.
    fn get_devices(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        found: &mut dyn FnMut(ScanDevice),
    ) -> Result<(), DriverError>;

    /// Acquire pages from `options.device`.
    fn scan(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        sink: &mut dyn ScanEventSink,
    ) -> Result<(), DriverError>;
}

/// [`ScanEventSink`] that forwards into a bounded channel.
///
/// Must be driven from a blocking thread: sends wait for the consumer.
pub struct UpdateSink {
    tx: mpsc::Sender<ScanUpdate>,
}

impl UpdateSink {
    pub fn new(tx: mpsc::Sender<ScanUpdate>) -> Self {
        Self { tx }
    }
}

impl ScanEventSink for UpdateSink {
    fn page_start(&mut self) {
        let _ = self.tx.blocking_send(ScanUpdate::PageStart);
    }

    fn page_progress(&mut self, progress: f64) {
        let _ = self.tx.blocking_send(ScanUpdate::Progress(progress));
    }

    fn page(&mut self, image: ImagePayload) -> Result<(), DriverError> {
        self.tx
            .blocking_send(ScanUpdate::Page(image))
            .map_err(|_| DriverError::Disconnected)
    }
}

/// Drivers available to this process, keyed by family.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<Driver, Arc<dyn ScanDriver>>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the drivers compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatedDriver::new()));
        registry
    }

    /// Add or replace the implementation for a driver family.
    pub fn register(&mut self, driver: Arc<dyn ScanDriver>) {
        self.drivers.insert(driver.driver(), driver);
    }

    pub fn get(&self, driver: Driver) -> Result<Arc<dyn ScanDriver>, DriverError> {
        let resolved = driver.resolve();
        self.drivers.get(&resolved).cloned().ok_or_else(|| {
            DriverError::Unsupported(format!("no {} driver is registered", resolved))
        })
    }

    pub fn supports(&self, driver: Driver) -> bool {
        self.drivers.contains_key(&driver.resolve())
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.drivers.keys().map(|d| d.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("drivers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_sim_only() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.supports(Driver::Sim));
        assert!(!registry.supports(Driver::Twain));

        let err = registry.get(Driver::Escl).err().unwrap();
        assert!(matches!(err, DriverError::Unsupported(_)));
    }

    #[test]
    fn update_sink_reports_disconnect_on_page() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = UpdateSink::new(tx);
        sink.page_start();
        let page = ImagePayload {
            width: 1,
            height: 1,
            pixel_format: paperflow_protocol::PixelFormat::Gray8,
            data: vec![0],
        };
        assert!(matches!(sink.page(page), Err(DriverError::Disconnected)));
    }
}
