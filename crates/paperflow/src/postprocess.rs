//! Per-page post-processing: thumbnails, barcodes and the OCR hand-off.
//!
//! Everything here is best effort. A failing step is logged and the page
//! is still produced.

use image::DynamicImage;
use paperflow_protocol::ScanOptions;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::processed::{BarcodeResult, PostProcessingData, ProcessedImage};
use crate::storage::MemoryImage;

/// Finds a barcode on a page.
pub trait BarcodeDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> anyhow::Result<Option<BarcodeResult>>;
}

/// Accepts completed pages for asynchronous text extraction.
pub trait OcrQueue: Send + Sync {
    fn enqueue(&self, image: &ProcessedImage, options: &ScanOptions) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct LocalPostProcessor {
    barcode_detector: Option<Arc<dyn BarcodeDetector>>,
    ocr_queue: Option<Arc<dyn OcrQueue>>,
}

impl LocalPostProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_barcode_detector(mut self, detector: Arc<dyn BarcodeDetector>) -> Self {
        self.barcode_detector = Some(detector);
        self
    }

    pub fn with_ocr_queue(mut self, queue: Arc<dyn OcrQueue>) -> Self {
        self.ocr_queue = Some(queue);
        self
    }

    /// Compute the post-processing data `options` asks for.
    pub fn process(&self, page: u32, image: &MemoryImage, options: &ScanOptions) -> PostProcessingData {
        let mut data = PostProcessingData::default();

        if let Some(size) = options.thumbnail_size {
            data.thumbnail = Some(image.image().thumbnail(size, size));
        }

        if options.detect_barcodes {
            match &self.barcode_detector {
                Some(detector) => match detector.detect(image.image()) {
                    Ok(result) => data.barcode = result,
                    Err(e) => warn!("[Scan] Barcode detection failed on page {}: {}", page, e),
                },
                None => debug!("[Scan] Barcode detection requested but no detector is set"),
            }
        }

        data
    }

    /// Queue `image` for OCR when requested.
    pub fn enqueue_ocr(&self, page: u32, image: &ProcessedImage, options: &ScanOptions) {
        if !options.ocr {
            return;
        }
        let Some(queue) = &self.ocr_queue else {
            debug!("[Scan] OCR requested but no queue is set");
            return;
        };
        if let Err(e) = queue.enqueue(image, options) {
            warn!("[Scan] Could not queue page {} for OCR: {}", page, e);
        }
    }
}

impl std::fmt::Debug for LocalPostProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPostProcessor")
            .field("barcode_detector", &self.barcode_detector.is_some())
            .field("ocr_queue", &self.ocr_queue.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScanningContext;
    use crate::storage::ImageStorage;
    use image::{Rgb, RgbImage};
    use paperflow_protocol::Driver;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn page() -> MemoryImage {
        MemoryImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 200, Rgb([1, 2, 3]))))
    }

    struct FailingDetector;

    impl BarcodeDetector for FailingDetector {
        fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Option<BarcodeResult>> {
            anyhow::bail!("decoder crashed")
        }
    }

    struct FixedDetector;

    impl BarcodeDetector for FixedDetector {
        fn detect(&self, _image: &DynamicImage) -> anyhow::Result<Option<BarcodeResult>> {
            Ok(Some(BarcodeResult {
                format: "qr".into(),
                text: "batch-7".into(),
            }))
        }
    }

    #[derive(Default)]
    struct CountingQueue(AtomicUsize);

    impl OcrQueue for CountingQueue {
        fn enqueue(&self, _image: &ProcessedImage, _options: &ScanOptions) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn thumbnail_fits_the_requested_size() {
        let mut options = ScanOptions::for_driver(Driver::Sim);
        options.thumbnail_size = Some(100);
        let data = LocalPostProcessor::new().process(1, &page(), &options);
        let thumbnail = data.thumbnail.unwrap();
        assert_eq!((thumbnail.width(), thumbnail.height()), (100, 50));
    }

    #[test]
    fn barcode_failures_are_soft() {
        let mut options = ScanOptions::for_driver(Driver::Sim);
        options.detect_barcodes = true;

        let failing = LocalPostProcessor::new().with_barcode_detector(Arc::new(FailingDetector));
        assert!(failing.process(1, &page(), &options).barcode.is_none());

        let fixed = LocalPostProcessor::new().with_barcode_detector(Arc::new(FixedDetector));
        let barcode = fixed.process(1, &page(), &options).barcode.unwrap();
        assert_eq!(barcode.text, "batch-7");
    }

    #[test]
    fn ocr_is_only_queued_on_request() {
        let queue = Arc::new(CountingQueue::default());
        let post = LocalPostProcessor::new().with_ocr_queue(queue.clone());
        let context = ScanningContext::new();
        let image = context.create_processed_image(ImageStorage::Memory(page())).unwrap();

        let mut options = ScanOptions::for_driver(Driver::Sim);
        post.enqueue_ocr(1, &image, &options);
        options.ocr = true;
        post.enqueue_ocr(1, &image, &options);
        assert_eq!(queue.0.load(Ordering::SeqCst), 1);
    }
}
