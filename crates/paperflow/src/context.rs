//! Image artifact lifecycle: storage decisions and disposal tracking.

use paperflow_protocol::defaults::DEFAULT_JPEG_QUALITY;
use paperflow_protocol::BitDepth;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ScanError;
use crate::processed::{ImageMetadata, PostProcessingData, ProcessedImage};
use crate::storage::{
    ArtifactRegistry, FileStorageManager, ImageFileStorage, ImageMemoryStorage, ImageStorage,
    MemoryImage,
};

/// How a new [`ProcessedImage`] should be stored and described.
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Reduces the pixels to this depth; otherwise it is derived from the
    /// pixel format.
    pub bit_depth: Option<BitDepth>,
    pub lossless: bool,
    /// JPEG quality for lossy backing files.
    pub quality: u8,
    pub post_processing: PostProcessingData,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            bit_depth: None,
            lossless: false,
            quality: DEFAULT_JPEG_QUALITY,
            post_processing: PostProcessingData::default(),
        }
    }
}

/// Owns every image artifact produced while scanning.
///
/// With a [`FileStorageManager`] all images are kept as backing files;
/// without one they are kept in memory. Disposing the context disposes
/// every artifact that is still alive.
pub struct ScanningContext {
    file_storage: Option<FileStorageManager>,
    registry: ArtifactRegistry,
    temp_folder: PathBuf,
    disposed: AtomicBool,
}

impl ScanningContext {
    /// Memory-only context.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_file_storage(file_storage: FileStorageManager) -> Self {
        Self::build(Some(file_storage))
    }

    fn build(file_storage: Option<FileStorageManager>) -> Self {
        Self {
            file_storage,
            registry: ArtifactRegistry::new(),
            temp_folder: std::env::temp_dir(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Folder for [`ScanningContext::save_to_temp_file`] exports.
    pub fn with_temp_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.temp_folder = folder.into();
        self
    }

    pub fn file_storage(&self) -> Option<&FileStorageManager> {
        self.file_storage.as_ref()
    }

    pub fn storage_folder(&self) -> Option<&Path> {
        self.file_storage.as_ref().map(FileStorageManager::folder)
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    /// Artifacts not yet disposed.
    pub fn live_artifacts(&self) -> usize {
        self.registry.len()
    }

    pub fn create_processed_image(&self, storage: ImageStorage) -> Result<ProcessedImage, ScanError> {
        self.create_processed_image_with(storage, ImageOptions::default())
    }

    pub fn create_processed_image_with(
        &self,
        storage: ImageStorage,
        options: ImageOptions,
    ) -> Result<ProcessedImage, ScanError> {
        let derived_depth = match &storage {
            ImageStorage::Memory(memory) => Some(memory.bit_depth()),
            _ => None,
        };
        let (storage, decoded) =
            self.normalize(storage, options.bit_depth, options.lossless, options.quality)?;

        let bit_depth = options
            .bit_depth
            .or(derived_depth)
            .or_else(|| decoded.as_ref().map(MemoryImage::bit_depth))
            .unwrap_or_else(|| stored_bit_depth(&storage));

        let artifact = match &storage {
            ImageStorage::File(file) if !file.persisted => {
                let path = file.path.clone();
                self.registry.register(move || {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("[Storage] Could not delete {}: {}", path.display(), e);
                    } else {
                        debug!("[Storage] Deleted {}", path.display());
                    }
                })
            }
            _ => self.registry.register(|| {}),
        };

        Ok(ProcessedImage::new(
            storage,
            self.registry.clone(),
            artifact,
            ImageMetadata {
                bit_depth,
                lossless: options.lossless,
            },
            options.post_processing,
        ))
    }

    /// Choose the live representation for `storage`, reducing decoded
    /// pixels to `depth` when one is requested.
    ///
    /// Also returns the decoded image when decoding was needed anyway.
    fn normalize(
        &self,
        storage: ImageStorage,
        depth: Option<BitDepth>,
        lossless: bool,
        quality: u8,
    ) -> Result<(ImageStorage, Option<MemoryImage>), ScanError> {
        let reduce = |memory: MemoryImage| match depth {
            Some(depth) => memory.into_bit_depth(depth),
            None => memory,
        };
        match (&self.file_storage, storage) {
            (Some(files), ImageStorage::Memory(memory)) => {
                let file = write_memory(files, &memory, depth, lossless, quality)?;
                Ok((ImageStorage::File(file), None))
            }
            (Some(_), ImageStorage::File(file)) => Ok((ImageStorage::File(file), None)),
            (Some(files), ImageStorage::Blob(blob)) if blob.is_opaque() => {
                let file = write_blob(files, &blob)?;
                Ok((ImageStorage::File(file), None))
            }
            (Some(files), ImageStorage::Blob(blob)) => {
                let memory = MemoryImage::decode(&blob.bytes)?;
                let file = write_memory(files, &memory, depth, lossless, quality)?;
                Ok((ImageStorage::File(file), Some(memory)))
            }
            (None, ImageStorage::Memory(memory)) => {
                Ok((ImageStorage::Memory(reduce(memory)), None))
            }
            (None, ImageStorage::File(file)) => {
                let memory = reduce(MemoryImage::open(&file.path)?);
                Ok((ImageStorage::Memory(memory.clone()), Some(memory)))
            }
            (None, ImageStorage::Blob(blob)) if blob.is_opaque() => {
                Ok((ImageStorage::Blob(blob), None))
            }
            (None, ImageStorage::Blob(blob)) => {
                let memory = reduce(MemoryImage::decode(&blob.bytes)?);
                Ok((ImageStorage::Memory(memory.clone()), Some(memory)))
            }
        }
    }

    /// Export to a new file in the temp folder. The caller owns the file.
    pub fn save_to_temp_file(&self, image: &MemoryImage, lossless: bool) -> Result<PathBuf, ScanError> {
        let encoded = image.encode_smallest(image.bit_depth(), lossless, DEFAULT_JPEG_QUALITY)?;
        fs::create_dir_all(&self.temp_folder)?;
        let path = self.temp_folder.join(format!(
            "paperflow-{}.{}",
            Uuid::new_v4().simple(),
            encoded.extension()
        ));
        fs::write(&path, &encoded.bytes)?;
        Ok(path)
    }

    /// Render `image` with its transforms and export it like
    /// [`ScanningContext::save_to_temp_file`].
    pub fn save_processed_to_temp_file(&self, image: &ProcessedImage) -> Result<PathBuf, ScanError> {
        let metadata = image.metadata();
        let rendered = image.render()?.into_bit_depth(metadata.bit_depth);
        self.save_to_temp_file(&rendered, metadata.lossless)
    }

    /// Dispose every live artifact and clean up the backing folder.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.registry.dispose_all();
        debug!("[Context] Disposed with {} live artifact(s)", count);
        if let Some(files) = &self.file_storage {
            files.cleanup();
        }
    }
}

impl Default for ScanningContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanningContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ScanningContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanningContext")
            .field("storage_folder", &self.storage_folder())
            .field("registry", &self.registry)
            .finish()
    }
}

fn write_memory(
    files: &FileStorageManager,
    memory: &MemoryImage,
    depth: Option<BitDepth>,
    lossless: bool,
    quality: u8,
) -> Result<ImageFileStorage, ScanError> {
    let depth = depth.unwrap_or_else(|| memory.bit_depth());
    let encoded = memory.encode_smallest(depth, lossless, quality)?;
    let path = files.next_file_path(encoded.extension());
    write_new_file(&path, &encoded.bytes)?;
    Ok(ImageFileStorage::new(path))
}

fn write_blob(
    files: &FileStorageManager,
    blob: &ImageMemoryStorage,
) -> Result<ImageFileStorage, ScanError> {
    let path = files.next_file_path(&blob.type_hint.to_ascii_lowercase());
    write_new_file(&path, &blob.bytes)?;
    Ok(ImageFileStorage::new(path))
}

/// Write a file, leaving nothing behind on failure.
fn write_new_file(path: &Path, bytes: &[u8]) -> Result<(), ScanError> {
    if let Err(e) = fs::write(path, bytes) {
        let _ = fs::remove_file(path);
        return Err(e.into());
    }
    Ok(())
}

fn stored_bit_depth(storage: &ImageStorage) -> BitDepth {
    storage
        .load()
        .map(|memory| memory.bit_depth())
        .unwrap_or(BitDepth::Color)
}
