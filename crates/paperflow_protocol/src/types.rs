//! Protocol payload types and the shared scan data model.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::defaults::DEFAULT_DPI;
use crate::error::{ProtocolError, Result};

// ============================================================================
// Canonical Enums
// ============================================================================

/// Driver family used to talk to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Resolved to the platform's preferred driver during validation.
    #[default]
    Default,
    Wia,
    Twain,
    Sane,
    Escl,
    Apple,
    /// Built-in simulated driver (no hardware).
    Sim,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Default => "default",
            Driver::Wia => "wia",
            Driver::Twain => "twain",
            Driver::Sane => "sane",
            Driver::Escl => "escl",
            Driver::Apple => "apple",
            Driver::Sim => "sim",
        }
    }

    /// The driver `Default` stands for on the current platform.
    pub fn platform_default() -> Driver {
        if cfg!(windows) {
            Driver::Wia
        } else if cfg!(target_os = "macos") {
            Driver::Apple
        } else {
            Driver::Sane
        }
    }

    /// Resolve `Default` into a concrete driver; other values pass through.
    pub fn resolve(self) -> Driver {
        match self {
            Driver::Default => Driver::platform_default(),
            other => other,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Driver {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Driver::Default),
            "wia" => Ok(Driver::Wia),
            "twain" => Ok(Driver::Twain),
            "sane" => Ok(Driver::Sane),
            "escl" => Ok(Driver::Escl),
            "apple" => Ok(Driver::Apple),
            "sim" => Ok(Driver::Sim),
            _ => Err(format!(
                "Invalid driver: '{}'. Expected: default, wia, twain, sane, escl, apple, or sim",
                s
            )),
        }
    }
}

/// Worker process variant.
///
/// Some driver families only work inside a process of a specific
/// architecture, so the pool keeps a separate supply per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Same architecture as the parent; hosted by the main executable.
    Native,
    /// 32-bit Windows host; a separate executable.
    WinX86,
}

impl WorkerType {
    pub const ALL: [WorkerType; 2] = [WorkerType::Native, WorkerType::WinX86];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Native => "native",
            WorkerType::WinX86 => "win_x86",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which worker architecture must host drivers that cannot run in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverArch {
    #[default]
    Native,
    X86,
}

impl DriverArch {
    pub fn worker_type(self) -> WorkerType {
        match self {
            DriverArch::Native => WorkerType::Native,
            DriverArch::X86 => WorkerType::WinX86,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaperSource {
    #[default]
    Auto,
    Flatbed,
    Feeder,
    Duplex,
}

impl FromStr for PaperSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(PaperSource::Auto),
            "flatbed" => Ok(PaperSource::Flatbed),
            "feeder" | "adf" => Ok(PaperSource::Feeder),
            "duplex" => Ok(PaperSource::Duplex),
            _ => Err(format!(
                "Invalid paper source: '{}'. Expected: auto, flatbed, feeder, or duplex",
                s
            )),
        }
    }
}

/// Requested color mode of a scan, and the bit depth recorded on each page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitDepth {
    #[default]
    Color,
    Grayscale,
    BlackAndWhite,
}

impl FromStr for BitDepth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "color" => Ok(BitDepth::Color),
            "gray" | "grayscale" => Ok(BitDepth::Grayscale),
            "bw" | "black_and_white" => Ok(BitDepth::BlackAndWhite),
            _ => Err(format!(
                "Invalid bit depth: '{}'. Expected: color, grayscale, or bw",
                s
            )),
        }
    }
}

/// Logical pixel format of a raw image.
///
/// `Bw1` is transported one byte per pixel (0 or 255); the format records
/// that the image is bilevel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Bw1,
    Gray8,
    Rgb24,
    Argb32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bw1 | PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Argb32 => 4,
        }
    }
}

// ============================================================================
// Data model
// ============================================================================

/// A device returned by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanDevice {
    pub driver: Driver,
    pub id: String,
    pub name: String,
}

impl ScanDevice {
    pub fn new(driver: Driver, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            driver,
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Scan request descriptor. Treated as immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub driver: Driver,
    pub device: Option<ScanDevice>,
    pub paper_source: PaperSource,
    pub dpi: u32,
    pub bit_depth: BitDepth,
    /// Native window handle that owns any driver UI.
    pub dialog_parent: Option<u64>,
    pub use_native_ui: bool,
    /// Worker architecture for drivers that always run out of process.
    pub driver_arch: DriverArch,
    /// Host the driver in a native worker even if it could run in-process.
    pub use_worker: bool,
    /// Store pages losslessly.
    pub max_quality: bool,
    /// JPEG quality (0-100) for lossy backing files; `None` uses the default.
    pub quality: Option<u8>,
    pub thumbnail_size: Option<u32>,
    pub detect_barcodes: bool,
    /// Queue completed pages for text extraction.
    pub ocr: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            driver: Driver::Default,
            device: None,
            paper_source: PaperSource::Auto,
            dpi: DEFAULT_DPI,
            bit_depth: BitDepth::Color,
            dialog_parent: None,
            use_native_ui: false,
            driver_arch: DriverArch::Native,
            use_worker: false,
            max_quality: false,
            quality: None,
            thumbnail_size: None,
            detect_barcodes: false,
            ocr: false,
        }
    }
}

impl ScanOptions {
    pub fn for_driver(driver: Driver) -> Self {
        Self {
            driver,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: ScanDevice) -> Self {
        self.driver = device.driver;
        self.device = Some(device);
        self
    }
}

/// Raw pixel buffer as produced by a driver, row-major without padding.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ImagePayload {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    /// Check that the buffer length matches the declared geometry.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ProtocolError::InvalidImage(format!(
                "empty image {}x{}",
                self.width, self.height
            )));
        }
        if self.data.len() != self.expected_len() {
            return Err(ProtocolError::InvalidImage(format!(
                "{}x{} {:?} needs {} bytes, got {}",
                self.width,
                self.height,
                self.pixel_format,
                self.expected_len(),
                self.data.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

// ============================================================================
// Channel payloads
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// Backing-file folder of the parent, if it stores pages on disk.
    pub storage_folder: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagePayload {
    pub image: ImagePayload,
}

/// Fault classification carried across the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    DeviceNotFound,
    DeviceOffline,
    NoPages,
    Unsupported,
    Driver,
    Internal,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::DeviceNotFound => "device_not_found",
            FaultKind::DeviceOffline => "device_offline",
            FaultKind::NoPages => "no_pages",
            FaultKind::Unsupported => "unsupported",
            FaultKind::Driver => "driver",
            FaultKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: FaultKind,
    pub message: String,
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_parse_and_display() {
        assert_eq!("SIM".parse::<Driver>().unwrap(), Driver::Sim);
        assert_eq!(Driver::Twain.to_string(), "twain");
        assert!("carrier-pigeon".parse::<Driver>().is_err());
    }

    #[test]
    fn default_driver_resolves_to_platform_driver() {
        let resolved = Driver::Default.resolve();
        assert_ne!(resolved, Driver::Default);
        assert_eq!(Driver::Escl.resolve(), Driver::Escl);
    }

    #[test]
    fn driver_arch_maps_to_worker_type() {
        assert_eq!(DriverArch::Native.worker_type(), WorkerType::Native);
        assert_eq!(DriverArch::X86.worker_type(), WorkerType::WinX86);
    }

    #[test]
    fn scan_options_fill_missing_fields_with_defaults() {
        let options: ScanOptions = serde_json::from_str(r#"{"driver":"sim","dpi":300}"#).unwrap();
        assert_eq!(options.driver, Driver::Sim);
        assert_eq!(options.dpi, 300);
        assert_eq!(options.bit_depth, BitDepth::Color);
        assert!(options.device.is_none());
    }

    #[test]
    fn with_device_adopts_device_driver() {
        let device = ScanDevice::new(Driver::Sim, "sim:flatbed", "Flatbed");
        let options = ScanOptions::default().with_device(device.clone());
        assert_eq!(options.driver, Driver::Sim);
        assert_eq!(options.device, Some(device));
    }

    #[test]
    fn image_payload_survives_json() {
        let payload = ImagePayload {
            width: 2,
            height: 1,
            pixel_format: PixelFormat::Rgb24,
            data: vec![1, 2, 3, 4, 5, 6],
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"data\":\"AQIDBAUG\""));
        let back: ImagePayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn image_payload_validation_checks_length() {
        let mut payload = ImagePayload {
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Gray8,
            data: vec![0; 4],
        };
        assert!(payload.validate().is_ok());
        payload.data.pop();
        assert!(matches!(
            payload.validate(),
            Err(ProtocolError::InvalidImage(_))
        ));
    }
}
