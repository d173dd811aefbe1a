//! Image storage representations and conversions between them.

pub mod file_manager;
pub mod registry;

pub use file_manager::FileStorageManager;
pub use registry::{ArtifactId, ArtifactRegistry};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use paperflow_protocol::{BitDepth, ImagePayload, PixelFormat};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::ScanError;

/// Type hint of blobs that are stored as-is instead of decoded.
pub const PDF_TYPE_HINT: &str = "pdf";

/// A decoded image plus the logical format it was produced in.
#[derive(Clone)]
pub struct MemoryImage {
    image: DynamicImage,
    pixel_format: PixelFormat,
}

impl MemoryImage {
    /// Wrap a decoded image, normalising it to 8-bit gray, RGB or RGBA.
    pub fn new(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(_) => Self {
                image,
                pixel_format: PixelFormat::Gray8,
            },
            DynamicImage::ImageRgb8(_) => Self {
                image,
                pixel_format: PixelFormat::Rgb24,
            },
            DynamicImage::ImageRgba8(_) => Self {
                image,
                pixel_format: PixelFormat::Argb32,
            },
            DynamicImage::ImageLumaA8(_) | DynamicImage::ImageRgba16(_) => Self {
                image: DynamicImage::ImageRgba8(image.to_rgba8()),
                pixel_format: PixelFormat::Argb32,
            },
            DynamicImage::ImageLuma16(_) => Self {
                image: DynamicImage::ImageLuma8(image.to_luma8()),
                pixel_format: PixelFormat::Gray8,
            },
            other => Self {
                image: DynamicImage::ImageRgb8(other.to_rgb8()),
                pixel_format: PixelFormat::Rgb24,
            },
        }
    }

    /// A bilevel image; every pixel becomes 0 or 255.
    pub fn bilevel(mut image: GrayImage) -> Self {
        for pixel in image.pixels_mut() {
            pixel.0[0] = if pixel.0[0] >= 128 { 255 } else { 0 };
        }
        Self {
            image: DynamicImage::ImageLuma8(image),
            pixel_format: PixelFormat::Bw1,
        }
    }

    /// Build from a raw driver buffer.
    pub fn from_payload(payload: ImagePayload) -> Result<Self, ScanError> {
        payload.validate()?;
        let ImagePayload {
            width,
            height,
            pixel_format,
            data,
        } = payload;
        let mismatch = || ScanError::InvalidImage(format!("{}x{} {:?}", width, height, pixel_format));

        match pixel_format {
            PixelFormat::Bw1 => {
                let gray = GrayImage::from_raw(width, height, data).ok_or_else(mismatch)?;
                Ok(Self::bilevel(gray))
            }
            PixelFormat::Gray8 => {
                let gray = GrayImage::from_raw(width, height, data).ok_or_else(mismatch)?;
                Ok(Self::new(DynamicImage::ImageLuma8(gray)))
            }
            PixelFormat::Rgb24 => {
                let rgb = image::RgbImage::from_raw(width, height, data).ok_or_else(mismatch)?;
                Ok(Self::new(DynamicImage::ImageRgb8(rgb)))
            }
            PixelFormat::Argb32 => {
                let rgba: Vec<u8> = data
                    .chunks_exact(4)
                    .flat_map(|p| [p[1], p[2], p[3], p[0]])
                    .collect();
                let rgba = RgbaImage::from_raw(width, height, rgba).ok_or_else(mismatch)?;
                Ok(Self::new(DynamicImage::ImageRgba8(rgba)))
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ScanError> {
        Ok(Self::new(image::load_from_memory(bytes)?))
    }

    pub fn open(path: &Path) -> Result<Self, ScanError> {
        Ok(Self::new(image::open(path)?))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Bit depth implied by the logical pixel format.
    pub fn bit_depth(&self) -> BitDepth {
        match self.pixel_format {
            PixelFormat::Bw1 => BitDepth::BlackAndWhite,
            PixelFormat::Gray8 => BitDepth::Grayscale,
            PixelFormat::Rgb24 | PixelFormat::Argb32 => BitDepth::Color,
        }
    }

    /// Reduce to `depth`. Never adds color or gray levels back.
    pub fn into_bit_depth(self, depth: BitDepth) -> Self {
        self.reduced(depth).unwrap_or(self)
    }

    fn reduced(&self, depth: BitDepth) -> Option<Self> {
        match (depth, self.pixel_format) {
            (BitDepth::BlackAndWhite, PixelFormat::Bw1) => None,
            (BitDepth::BlackAndWhite, _) => Some(Self::bilevel(self.image.to_luma8())),
            (BitDepth::Grayscale, PixelFormat::Rgb24 | PixelFormat::Argb32) => {
                Some(Self::new(DynamicImage::ImageLuma8(self.image.to_luma8())))
            }
            _ => None,
        }
    }

    /// Same dimensions and pixel values, ignoring the storage layout.
    pub fn same_pixels(&self, other: &MemoryImage) -> bool {
        self.width() == other.width()
            && self.height() == other.height()
            && self.image.to_rgba8().as_raw() == other.image.to_rgba8().as_raw()
    }

    pub fn encode(&self, format: ImageFormat, quality: u8) -> Result<Vec<u8>, ScanError> {
        let mut bytes = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                let mut encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
                match &self.image {
                    DynamicImage::ImageLuma8(gray) => encoder.encode_image(gray)?,
                    other => encoder.encode_image(&other.to_rgb8())?,
                }
            }
            format => self.image.write_to(&mut Cursor::new(&mut bytes), format)?,
        }
        Ok(bytes)
    }

    /// Encode at `bit_depth` in the smallest adequate format.
    ///
    /// Bilevel, transparent and lossless images are always PNG; otherwise
    /// whichever of PNG and JPEG is smaller wins.
    pub fn encode_smallest(
        &self,
        bit_depth: BitDepth,
        lossless: bool,
        quality: u8,
    ) -> Result<EncodedImage, ScanError> {
        let reduced = self.reduced(bit_depth);
        let image = reduced.as_ref().unwrap_or(self);

        let png = EncodedImage {
            bytes: image.encode(ImageFormat::Png, quality)?,
            format: ImageFormat::Png,
        };
        let png_only = lossless
            || image.pixel_format == PixelFormat::Bw1
            || image.pixel_format == PixelFormat::Argb32;
        if png_only {
            return Ok(png);
        }
        let jpeg = EncodedImage {
            bytes: image.encode(ImageFormat::Jpeg, quality)?,
            format: ImageFormat::Jpeg,
        };
        Ok(if jpeg.bytes.len() < png.bytes.len() {
            jpeg
        } else {
            png
        })
    }
}

impl fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("pixel_format", &self.pixel_format)
            .finish()
    }
}

/// Encoded bytes and their format.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl EncodedImage {
    pub fn extension(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "jpg",
            _ => "png",
        }
    }
}

/// A backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFileStorage {
    pub path: PathBuf,
    /// Owned by someone else; never deleted on disposal.
    pub persisted: bool,
}

impl ImageFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persisted: false,
        }
    }

    pub fn persisted(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persisted: true,
        }
    }
}

/// Encoded bytes held in memory, e.g. a whole document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMemoryStorage {
    pub bytes: Vec<u8>,
    /// File extension describing the content (`"pdf"`, `"png"` ...).
    pub type_hint: String,
}

impl ImageMemoryStorage {
    pub fn new(bytes: Vec<u8>, type_hint: impl Into<String>) -> Self {
        Self {
            bytes,
            type_hint: type_hint.into(),
        }
    }

    /// Stored verbatim rather than decoded.
    pub fn is_opaque(&self) -> bool {
        self.type_hint.eq_ignore_ascii_case(PDF_TYPE_HINT)
    }
}

/// Exactly one representation of an image.
#[derive(Debug, Clone)]
pub enum ImageStorage {
    Memory(MemoryImage),
    File(ImageFileStorage),
    Blob(ImageMemoryStorage),
}

impl ImageStorage {
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            ImageStorage::File(file) => Some(&file.path),
            _ => None,
        }
    }

    /// Decode into memory. Opaque blobs cannot be decoded.
    pub fn load(&self) -> Result<MemoryImage, ScanError> {
        match self {
            ImageStorage::Memory(memory) => Ok(memory.clone()),
            ImageStorage::File(file) => MemoryImage::open(&file.path),
            ImageStorage::Blob(blob) if blob.is_opaque() => Err(ScanError::InvalidImage(format!(
                "cannot decode a '{}' blob",
                blob.type_hint
            ))),
            ImageStorage::Blob(blob) => MemoryImage::decode(&blob.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> MemoryImage {
        let rgb = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7) as u8, (y * 5) as u8, ((x + y) * 3) as u8])
        });
        MemoryImage::new(DynamicImage::ImageRgb8(rgb))
    }

    #[test]
    fn payload_formats_map_to_logical_formats() {
        let bw = MemoryImage::from_payload(ImagePayload {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Bw1,
            data: vec![0, 200],
        })
        .unwrap();
        assert_eq!(bw.pixel_format(), PixelFormat::Bw1);
        assert_eq!(bw.bit_depth(), BitDepth::BlackAndWhite);
        assert_eq!(bw.image().to_luma8().as_raw(), &vec![0, 255]);

        let argb = MemoryImage::from_payload(ImagePayload {
            width: 1,
            height: 1,
            pixel_format: PixelFormat::Argb32,
            data: vec![255, 10, 20, 30],
        })
        .unwrap();
        assert_eq!(argb.image().to_rgba8().as_raw(), &vec![10, 20, 30, 255]);
        assert_eq!(argb.bit_depth(), BitDepth::Color);
    }

    #[test]
    fn short_payload_is_rejected() {
        let err = MemoryImage::from_payload(ImagePayload {
            width: 4,
            height: 4,
            pixel_format: PixelFormat::Rgb24,
            data: vec![0; 10],
        })
        .unwrap_err();
        assert!(matches!(err, ScanError::InvalidImage(_)));
    }

    #[test]
    fn lossless_and_bilevel_images_use_png() {
        let image = gradient(32, 32);
        assert_eq!(
            image.encode_smallest(BitDepth::Color, true, 75).unwrap().format,
            ImageFormat::Png
        );

        let bw = MemoryImage::bilevel(GrayImage::from_fn(16, 16, |x, _| image::Luma([(x % 2 * 255) as u8])));
        assert_eq!(
            bw.encode_smallest(BitDepth::BlackAndWhite, false, 75).unwrap().extension(),
            "png"
        );
    }

    #[test]
    fn encoding_applies_the_requested_bit_depth() {
        let image = gradient(24, 24);

        let bw = image.encode_smallest(BitDepth::BlackAndWhite, false, 75).unwrap();
        assert_eq!(bw.format, ImageFormat::Png);
        let back = MemoryImage::decode(&bw.bytes).unwrap();
        assert_eq!(back.pixel_format(), PixelFormat::Gray8);
        assert!(back.image().to_luma8().pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));

        let gray = image.encode_smallest(BitDepth::Grayscale, true, 75).unwrap();
        let back = MemoryImage::decode(&gray.bytes).unwrap();
        assert_eq!(back.pixel_format(), PixelFormat::Gray8);
        assert_eq!(back.image().to_luma8().as_raw(), image.image().to_luma8().as_raw());
    }

    #[test]
    fn bit_depth_reduction_is_one_way() {
        let bw = gradient(8, 8).into_bit_depth(BitDepth::BlackAndWhite);
        assert_eq!(bw.pixel_format(), PixelFormat::Bw1);
        assert_eq!(bw.clone().into_bit_depth(BitDepth::Color).pixel_format(), PixelFormat::Bw1);
        assert_eq!(bw.into_bit_depth(BitDepth::Grayscale).pixel_format(), PixelFormat::Bw1);

        let gray = gradient(8, 8).into_bit_depth(BitDepth::Grayscale);
        assert_eq!(gray.pixel_format(), PixelFormat::Gray8);
        assert_eq!(gray.bit_depth(), BitDepth::Grayscale);
    }

    #[test]
    fn png_encoding_preserves_pixels() {
        let image = gradient(20, 10);
        let bytes = image.encode(ImageFormat::Png, 75).unwrap();
        let decoded = MemoryImage::decode(&bytes).unwrap();
        assert!(decoded.same_pixels(&image));
        assert_eq!(decoded.pixel_format(), PixelFormat::Rgb24);
    }

    #[test]
    fn opaque_blobs_do_not_decode() {
        let blob = ImageStorage::Blob(ImageMemoryStorage::new(b"%PDF-1.7".to_vec(), "PDF"));
        assert!(matches!(blob, ImageStorage::Blob(ref b) if b.is_opaque()));
        assert!(blob.load().is_err());
    }
}
