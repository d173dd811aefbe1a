//! Scan orchestration: validation, bridge selection, page production and
//! lifecycle events.
//!
//! `scan` returns a lazy stream. The bridge runs on its own task and feeds
//! a channel of capacity one, so at most one page is in flight ahead of
//! the consumer.

use futures::Stream;
use paperflow_protocol::defaults::DEFAULT_JPEG_QUALITY;
use paperflow_protocol::{ImagePayload, ScanDevice, ScanOptions};
use paperflow_worker::{CancellationToken, ScanUpdate};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::ScanBridgeFactory;
use crate::context::{ImageOptions, ScanningContext};
use crate::error::ScanError;
use crate::events::{ScanEvent, ScanEventBus};
use crate::postprocess::LocalPostProcessor;
use crate::processed::ProcessedImage;
use crate::storage::{ImageStorage, MemoryImage};
use crate::validate::{validate_options, Purpose};

pub type ImageStream = Pin<Box<dyn Stream<Item = Result<ProcessedImage, ScanError>> + Send>>;
pub type DeviceStream = Pin<Box<dyn Stream<Item = Result<ScanDevice, ScanError>> + Send>>;

const UPDATE_CAPACITY: usize = 1;
const DEVICE_CAPACITY: usize = 16;

pub struct ScanController {
    context: Arc<ScanningContext>,
    bridges: ScanBridgeFactory,
    post: LocalPostProcessor,
    events: ScanEventBus,
    propagate_errors: bool,
}

impl ScanController {
    pub fn new(context: Arc<ScanningContext>, bridges: ScanBridgeFactory) -> Self {
        Self {
            context,
            bridges,
            post: LocalPostProcessor::new(),
            events: ScanEventBus::new(),
            propagate_errors: false,
        }
    }

    pub fn with_post_processor(mut self, post: LocalPostProcessor) -> Self {
        self.post = post;
        self
    }

    pub fn with_event_bus(mut self, events: ScanEventBus) -> Self {
        self.events = events;
        self
    }

    /// Re-raise scan faults to the stream consumer, not just as events.
    pub fn propagate_errors(mut self, propagate: bool) -> Self {
        self.propagate_errors = propagate;
        self
    }

    pub fn events(&self) -> &ScanEventBus {
        &self.events
    }

    pub fn context(&self) -> &Arc<ScanningContext> {
        &self.context
    }

    /// Terminate pooled workers and dispose every live artifact.
    pub async fn shutdown(&self) {
        if let Some(pool) = self.bridges.pool() {
            pool.dispose().await;
        }
        self.context.dispose();
    }

    /// Enumerate devices into a list.
    pub async fn get_device_list(&self, options: &ScanOptions) -> Result<Vec<ScanDevice>, ScanError> {
        let options = validate_options(options, Purpose::DeviceList)?;
        let bridge = self.bridges.create(&options)?;
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(DEVICE_CAPACITY);

        let collect = async {
            let mut devices = Vec::new();
            while let Some(device) = rx.recv().await {
                devices.push(device);
            }
            devices
        };
        let (result, devices) = tokio::join!(bridge.get_devices(&options, &cancel, tx), collect);
        result?;
        debug!("[Devices] Found {} {} device(s)", devices.len(), options.driver);
        Ok(devices)
    }

    /// Enumerate devices lazily.
    pub fn get_devices(
        &self,
        options: &ScanOptions,
        cancel: CancellationToken,
    ) -> Result<DeviceStream, ScanError> {
        let options = validate_options(options, Purpose::DeviceList)?;
        let bridge = self.bridges.create(&options)?;

        let stream = async_stream::stream! {
            let (tx, mut rx) = mpsc::channel(DEVICE_CAPACITY);
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move {
                bridge.get_devices(&options, &task_cancel, tx).await
            });
            while let Some(device) = rx.recv().await {
                yield Ok(device);
            }
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => yield Err(e),
                Err(join) => yield Err(task_failed(join)),
            }
        };
        Ok(Box::pin(stream))
    }

    /// Start a scan.
    ///
    /// Options are validated before anything else happens; validation and
    /// routing errors are returned here and fire no events. Everything
    /// after that is reported through the event bus, and through the
    /// stream only when errors are propagated.
    ///
    /// Checking `cancel` between pulls is up to the consumer. A cancelled
    /// scan ends without an error.
    pub fn scan(&self, options: &ScanOptions, cancel: CancellationToken) -> Result<ImageStream, ScanError> {
        let options = validate_options(options, Purpose::Scan)?;
        let bridge = self.bridges.create(&options)?;

        info!(
            "[Scan] Starting on {} ({} dpi)",
            options.device.as_ref().map(|d| d.name.as_str()).unwrap_or("?"),
            options.dpi
        );
        self.events.emit(&ScanEvent::ScanStart);
        let guard = ScanEndGuard {
            events: self.events.clone(),
            pages: 0,
        };

        let context = Arc::clone(&self.context);
        let post = self.post.clone();
        let events = self.events.clone();
        let strict = self.propagate_errors;

        let stream = async_stream::stream! {
            let mut end = guard;
            if cancel.is_cancelled() {
                debug!("[Scan] Cancelled before start");
                return;
            }

            let (tx, mut rx) = mpsc::channel(UPDATE_CAPACITY);
            let task_options = options.clone();
            let task_cancel = cancel.clone();
            let task = tokio::spawn(async move {
                bridge.scan(&task_options, &task_cancel, tx).await
            });

            let mut progress = 0.0_f64;
            let mut page_failed = false;
            loop {
                if cancel.is_cancelled() {
                    debug!("[Scan] Cancelled after {} page(s)", end.pages);
                    break;
                }
                let Some(update) = rx.recv().await else { break };
                match update {
                    ScanUpdate::PageStart => {
                        end.pages += 1;
                        progress = 0.0;
                        events.emit(&ScanEvent::PageStart { page: end.pages });
                    }
                    ScanUpdate::Progress(value) => {
                        progress = progress.max(value.clamp(0.0, 1.0));
                        events.emit(&ScanEvent::PageProgress { page: end.pages, progress });
                    }
                    ScanUpdate::Page(payload) => {
                        if end.pages == 0 {
                            end.pages = 1;
                            events.emit(&ScanEvent::PageStart { page: 1 });
                        }
                        let page = end.pages;
                        match produce_page(&context, &post, &options, page, payload).await {
                            Ok(image) => {
                                debug!("[Scan] Page {} ready", page);
                                events.emit(&ScanEvent::PageEnd { page, image: image.clone() });
                                yield Ok(image);
                            }
                            Err(e) => {
                                report(&events, &e);
                                page_failed = true;
                                if strict {
                                    yield Err(e);
                                }
                                break;
                            }
                        }
                    }
                }
            }

            // Closing the channel stops the bridge at its next send.
            drop(rx);
            let outcome = match task.await {
                Ok(result) => result,
                Err(join) => Err(task_failed(join)),
            };
            if page_failed {
                return;
            }
            if let Err(e) = outcome {
                if cancel.is_cancelled() && !matches!(e, ScanError::ForcedAbort { .. }) {
                    debug!("[Scan] Ignoring error after cancel: {}", e);
                } else {
                    report(&events, &e);
                    if strict {
                        yield Err(e);
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("context", &self.context)
            .field("bridges", &self.bridges)
            .field("propagate_errors", &self.propagate_errors)
            .finish()
    }
}

/// Fires `ScanEnd` when the scan stream finishes or is dropped.
struct ScanEndGuard {
    events: ScanEventBus,
    pages: u32,
}

impl Drop for ScanEndGuard {
    fn drop(&mut self) {
        info!("[Scan] Finished with {} page(s)", self.pages);
        self.events.emit(&ScanEvent::ScanEnd { pages: self.pages });
    }
}

fn report(events: &ScanEventBus, err: &ScanError) {
    warn!("[Scan] {}", err);
    events.emit(&ScanEvent::error(err));
}

fn task_failed(err: tokio::task::JoinError) -> ScanError {
    if err.is_panic() {
        ScanError::Internal(format!("scan task panicked: {}", err))
    } else {
        ScanError::Internal(format!("scan task failed: {}", err))
    }
}

/// Decode, post-process and store one page.
async fn produce_page(
    context: &Arc<ScanningContext>,
    post: &LocalPostProcessor,
    options: &ScanOptions,
    page: u32,
    payload: ImagePayload,
) -> Result<ProcessedImage, ScanError> {
    let context = Arc::clone(context);
    let post = post.clone();
    let options = options.clone();
    tokio::task::spawn_blocking(move || {
        let memory = MemoryImage::from_payload(payload)?;
        let post_processing = post.process(page, &memory, &options);
        let image = context.create_processed_image_with(
            ImageStorage::Memory(memory),
            ImageOptions {
                bit_depth: Some(options.bit_depth),
                lossless: options.max_quality,
                quality: options.quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                post_processing,
            },
        )?;
        post.enqueue_ocr(page, &image, &options);
        Ok(image)
    })
    .await
    .map_err(task_failed)?
}
