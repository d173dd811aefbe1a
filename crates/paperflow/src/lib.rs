//! Paperflow scanning core.
//!
//! - [`ScanningContext`] owns image artifacts and decides where they live
//! - [`ScanBridgeFactory`] routes driver calls in-process or to a worker
//! - [`ScanController`] turns a request into a lazy stream of pages

pub mod bridge;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod postprocess;
pub mod processed;
pub mod storage;
pub mod validate;

pub use bridge::{LocalScanBridge, Route, ScanBridge, ScanBridgeFactory, WorkerScanBridge};
pub use config::ScanningConfig;
pub use context::{ImageOptions, ScanningContext};
pub use controller::{DeviceStream, ImageStream, ScanController};
pub use error::{ErrorKind, ScanError};
pub use events::{ScanEvent, ScanEventBus};
pub use postprocess::{BarcodeDetector, LocalPostProcessor, OcrQueue};
pub use processed::{BarcodeResult, ImageMetadata, PostProcessingData, ProcessedImage, Transform};
pub use storage::{
    ArtifactRegistry, FileStorageManager, ImageFileStorage, ImageMemoryStorage, ImageStorage,
    MemoryImage,
};
pub use validate::{validate_options, Purpose};

pub use paperflow_protocol::{
    BitDepth, Driver, DriverArch, PaperSource, PixelFormat, ScanDevice, ScanOptions, WorkerType,
};
pub use paperflow_logging::{Console, LogSettings};
pub use paperflow_worker::{CancellationToken, DriverRegistry};
