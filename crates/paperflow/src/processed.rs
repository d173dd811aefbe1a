//! The scan result unit.

use image::DynamicImage;
use paperflow_protocol::BitDepth;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::ScanError;
use crate::storage::{ArtifactId, ArtifactRegistry, ImageStorage, MemoryImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub bit_depth: BitDepth,
    pub lossless: bool,
}

/// Result of barcode detection on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeResult {
    pub format: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct PostProcessingData {
    pub thumbnail: Option<DynamicImage>,
    pub barcode: Option<BarcodeResult>,
}

/// Geometric operation recorded on an image and applied by `render`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Clockwise quarter turns.
    Rotate(u8),
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

impl Transform {
    fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Transform::Rotate(turns) => match turns % 4 {
                1 => image.rotate90(),
                2 => image.rotate180(),
                3 => image.rotate270(),
                _ => image,
            },
            Transform::Crop {
                x,
                y,
                width,
                height,
            } => image.crop_imm(x, y, width, height),
        }
    }
}

/// Storage shared by every clone of a [`ProcessedImage`].
///
/// Dropping the last reference unregisters the artifact, which runs its
/// disposer unless the owning context already did.
struct StorageHandle {
    storage: ImageStorage,
    registry: ArtifactRegistry,
    artifact: ArtifactId,
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.artifact);
    }
}

#[derive(Clone)]
pub struct ProcessedImage {
    storage: Arc<StorageHandle>,
    metadata: ImageMetadata,
    post_processing: PostProcessingData,
    transforms: Vec<Transform>,
}

impl ProcessedImage {
    pub(crate) fn new(
        storage: ImageStorage,
        registry: ArtifactRegistry,
        artifact: ArtifactId,
        metadata: ImageMetadata,
        post_processing: PostProcessingData,
    ) -> Self {
        Self {
            storage: Arc::new(StorageHandle {
                storage,
                registry,
                artifact,
            }),
            metadata,
            post_processing,
            transforms: Vec::new(),
        }
    }

    pub fn storage(&self) -> &ImageStorage {
        &self.storage.storage
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.storage.storage.file_path()
    }

    pub fn metadata(&self) -> ImageMetadata {
        self.metadata
    }

    pub fn post_processing(&self) -> &PostProcessingData {
        &self.post_processing
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn artifact_id(&self) -> ArtifactId {
        self.storage.artifact
    }

    /// A copy sharing the same storage with one more transform.
    pub fn with_transform(&self, transform: Transform) -> Self {
        let mut copy = self.clone();
        copy.transforms.push(transform);
        copy
    }

    pub fn with_post_processing(&self, post_processing: PostProcessingData) -> Self {
        let mut copy = self.clone();
        copy.post_processing = post_processing;
        copy
    }

    /// Decode the stored pixels without applying transforms.
    pub fn to_memory(&self) -> Result<MemoryImage, ScanError> {
        self.storage.storage.load()
    }

    /// Decode and apply the accumulated transforms.
    pub fn render(&self) -> Result<MemoryImage, ScanError> {
        let memory = self.to_memory()?;
        if self.transforms.is_empty() {
            return Ok(memory);
        }
        let bilevel = self.metadata.bit_depth == BitDepth::BlackAndWhite;
        let rendered = self
            .transforms
            .iter()
            .fold(memory.into_image(), |image, t| t.apply(image));
        Ok(if bilevel {
            MemoryImage::bilevel(rendered.to_luma8())
        } else {
            MemoryImage::new(rendered)
        })
    }

    /// Release this reference. Storage is freed with the last reference.
    pub fn dispose(self) {}
}

impl fmt::Debug for ProcessedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedImage")
            .field("storage", &self.storage.storage)
            .field("metadata", &self.metadata)
            .field("transforms", &self.transforms)
            .field("thumbnail", &self.post_processing.thumbnail.is_some())
            .field("barcode", &self.post_processing.barcode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processed(registry: &ArtifactRegistry, disposed: &Arc<AtomicUsize>) -> ProcessedImage {
        let counter = Arc::clone(disposed);
        let artifact = registry.register(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let rgb = RgbImage::from_fn(4, 2, |x, y| Rgb([x as u8, y as u8, 0]));
        ProcessedImage::new(
            ImageStorage::Memory(MemoryImage::new(DynamicImage::ImageRgb8(rgb))),
            registry.clone(),
            artifact,
            ImageMetadata {
                bit_depth: BitDepth::Color,
                lossless: true,
            },
            PostProcessingData::default(),
        )
    }

    #[test]
    fn storage_is_released_with_the_last_clone() {
        let registry = ArtifactRegistry::new();
        let disposed = Arc::new(AtomicUsize::new(0));
        let image = processed(&registry, &disposed);
        let copy = image.clone();

        image.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        copy.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn render_applies_transforms_in_order() {
        let registry = ArtifactRegistry::new();
        let disposed = Arc::new(AtomicUsize::new(0));
        let image = processed(&registry, &disposed)
            .with_transform(Transform::Rotate(1))
            .with_transform(Transform::Crop {
                x: 0,
                y: 0,
                width: 2,
                height: 3,
            });

        let rendered = image.render().unwrap();
        assert_eq!((rendered.width(), rendered.height()), (2, 3));
        assert_eq!(image.to_memory().unwrap().width(), 4);
    }
}
