//! Simulated scanner driver.
//!
//! Device behaviour is encoded in the device id, e.g.
//! `sim:feeder?pages=5&fail_at=3&steps=4&delay_ms=20`, so the same request
//! behaves identically in-process and inside a worker host.

use paperflow_protocol::{
    BitDepth, Driver, ImagePayload, PixelFormat, ScanDevice, ScanOptions,
};
use std::time::Duration;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::driver::{ScanDriver, ScanEventSink};
use crate::error::DriverError;

const DEVICE_PREFIX: &str = "sim:";
const DEFAULT_PAGES: u32 = 3;
const MAX_PAGES: u32 = 1000;
/// Rendered size is capped at this resolution to keep buffers small.
const MAX_RENDER_DPI: u32 = 300;

const DEVICES: [(&str, &str); 2] = [
    ("flatbed", "Simulated Flatbed"),
    ("feeder", "Simulated Document Feeder"),
];

/// Parsed behaviour of a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub struct SimDeviceSpec {
    pub name: String,
    pub pages: u32,
    /// 1-based page on which the device reports a fault.
    pub fail_at: Option<u32>,
    /// Progress notifications per page.
    pub steps: u32,
    /// Simulated acquisition time per page.
    pub delay: Duration,
}

impl SimDeviceSpec {
    pub fn parse(id: &str) -> Result<Self, DriverError> {
        let rest = id
            .strip_prefix(DEVICE_PREFIX)
            .ok_or_else(|| DriverError::DeviceNotFound(id.to_string()))?;
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, query),
            None => (rest, ""),
        };
        if !DEVICES.iter().any(|(known, _)| *known == name) {
            return Err(DriverError::DeviceNotFound(id.to_string()));
        }

        let mut spec = SimDeviceSpec {
            name: name.to_string(),
            pages: DEFAULT_PAGES,
            fail_at: None,
            steps: 1,
            delay: Duration::ZERO,
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let invalid =
                || DriverError::DeviceNotFound(format!("{}: invalid value for '{}'", id, key));
            let number = value.parse::<u64>().map_err(|_| invalid())?;
            let count = || u32::try_from(number).map_err(|_| invalid());
            match key.as_ref() {
                "pages" => spec.pages = count()?.min(MAX_PAGES),
                "fail_at" => spec.fail_at = Some(count()?),
                "steps" => spec.steps = count()?.max(1),
                "delay_ms" => spec.delay = Duration::from_millis(number),
                other => {
                    return Err(DriverError::DeviceNotFound(format!(
                        "{}: unknown parameter '{}'",
                        id, other
                    )))
                }
            }
        }

        Ok(spec)
    }
}

/// Driver producing synthetic gradient pages.
#[derive(Debug, Default)]
pub struct SimulatedDriver;

impl SimulatedDriver {
    pub fn new() -> Self {
        Self
    }
}

impl ScanDriver for SimulatedDriver {
    fn driver(&self) -> Driver {
        Driver::Sim
    }

    fn get_devices(
        &self,
        _options: &ScanOptions,
        cancel: &CancellationToken,
        found: &mut dyn FnMut(ScanDevice),
    ) -> Result<(), DriverError> {
        for (name, display) in DEVICES {
            if cancel.is_cancelled() {
                break;
            }
            found(ScanDevice::new(
                Driver::Sim,
                format!("{}{}", DEVICE_PREFIX, name),
                display,
            ));
        }
        Ok(())
    }

    fn scan(
        &self,
        options: &ScanOptions,
        cancel: &CancellationToken,
        sink: &mut dyn ScanEventSink,
    ) -> Result<(), DriverError> {
        let device = options
            .device
            .as_ref()
            .ok_or_else(|| DriverError::DeviceNotFound("no device selected".to_string()))?;
        let spec = SimDeviceSpec::parse(&device.id)?;
        debug!("[Sim] Scanning {:?}", spec);

        for page in 1..=spec.pages {
            if cancel.is_cancelled() {
                debug!("[Sim] Cancelled before page {}", page);
                break;
            }
            sink.page_start();
            if spec.fail_at == Some(page) {
                return Err(DriverError::DeviceOffline(format!(
                    "simulated fault on page {} of {}",
                    page, spec.pages
                )));
            }
            for step in 1..=spec.steps {
                if !spec.delay.is_zero() {
                    std::thread::sleep(spec.delay / spec.steps);
                }
                sink.page_progress(step as f64 / spec.steps as f64);
            }
            sink.page(render_page(page, options))?;
        }

        Ok(())
    }
}

/// Render a synthetic page at 1/10 of letter size per inch of resolution.
fn render_page(page: u32, options: &ScanOptions) -> ImagePayload {
    let dpi = options.dpi.clamp(10, MAX_RENDER_DPI);
    let width = (85 * dpi / 100).max(1);
    let height = (110 * dpi / 100).max(1);
    let shade = (page.wrapping_mul(40) % 256) as u8;

    let pixel_format = match options.bit_depth {
        BitDepth::Color => PixelFormat::Rgb24,
        BitDepth::Grayscale => PixelFormat::Gray8,
        BitDepth::BlackAndWhite => PixelFormat::Bw1,
    };

    let mut data = Vec::with_capacity((width * height) as usize * pixel_format.bytes_per_pixel());
    for y in 0..height {
        for x in 0..width {
            let gx = (x * 255 / width) as u8;
            let gy = (y * 255 / height) as u8;
            match pixel_format {
                PixelFormat::Rgb24 => data.extend_from_slice(&[gx, gy, shade]),
                PixelFormat::Gray8 => data.push((gx / 2 + gy / 2) ^ (shade / 4)),
                PixelFormat::Bw1 => data.push(if (x / 8 + y / 8 + page) % 2 == 0 { 0 } else { 255 }),
                PixelFormat::Argb32 => data.extend_from_slice(&[255, gx, gy, shade]),
            }
        }
    }

    ImagePayload {
        width,
        height,
        pixel_format,
        data,
    }
}
