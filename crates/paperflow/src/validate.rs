//! Scan option validation, run before any device or process interaction.

use paperflow_protocol::defaults::{MAX_DPI, MAX_THUMBNAIL_SIZE, MIN_DPI, MIN_THUMBNAIL_SIZE};
use paperflow_protocol::{Driver, DriverArch, ScanOptions};

use crate::error::ScanError;

/// What the options are about to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    DeviceList,
    Scan,
}

/// Check `options` and return a copy with `Driver::Default` resolved.
pub fn validate_options(options: &ScanOptions, purpose: Purpose) -> Result<ScanOptions, ScanError> {
    let mut options = options.clone();
    options.driver = options.driver.resolve();

    if !(MIN_DPI..=MAX_DPI).contains(&options.dpi) {
        return Err(ScanError::validation(format!(
            "dpi {} is outside {}..={}",
            options.dpi, MIN_DPI, MAX_DPI
        )));
    }
    if let Some(quality) = options.quality {
        if quality > 100 {
            return Err(ScanError::validation(format!(
                "jpeg quality {} is above 100",
                quality
            )));
        }
    }
    if let Some(size) = options.thumbnail_size {
        if !(MIN_THUMBNAIL_SIZE..=MAX_THUMBNAIL_SIZE).contains(&size) {
            return Err(ScanError::validation(format!(
                "thumbnail size {} is outside {}..={}",
                size, MIN_THUMBNAIL_SIZE, MAX_THUMBNAIL_SIZE
            )));
        }
    }
    if options.driver == Driver::Twain && !cfg!(windows) {
        return Err(ScanError::validation("the twain driver is only available on Windows"));
    }
    if options.driver_arch == DriverArch::X86 && options.driver != Driver::Twain {
        return Err(ScanError::validation(format!(
            "driver architecture x86 only applies to twain, not {}",
            options.driver
        )));
    }

    if purpose == Purpose::Scan {
        let device = options
            .device
            .as_ref()
            .ok_or_else(|| ScanError::validation("no device selected"))?;
        if device.id.trim().is_empty() {
            return Err(ScanError::validation("device id is empty"));
        }
        let device_driver = device.driver.resolve();
        if device_driver != options.driver {
            return Err(ScanError::validation(format!(
                "device '{}' belongs to driver {}, not {}",
                device.name, device_driver, options.driver
            )));
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperflow_protocol::ScanDevice;

    fn sim_options() -> ScanOptions {
        ScanOptions::for_driver(Driver::Sim)
            .with_device(ScanDevice::new(Driver::Sim, "sim:flatbed?pages=1", "Flatbed"))
    }

    #[test]
    fn default_driver_is_resolved() {
        let options = ScanOptions::default();
        let validated = validate_options(&options, Purpose::DeviceList).unwrap();
        assert_eq!(validated.driver, Driver::platform_default());
        assert_ne!(validated.driver, Driver::Default);
    }

    #[test]
    fn scan_requires_a_matching_device() {
        let missing = ScanOptions::for_driver(Driver::Sim);
        assert!(matches!(
            validate_options(&missing, Purpose::Scan),
            Err(ScanError::Validation(_))
        ));
        assert!(validate_options(&missing, Purpose::DeviceList).is_ok());

        let mut mismatched = sim_options();
        mismatched.driver = Driver::Escl;
        assert!(validate_options(&mismatched, Purpose::Scan).is_err());

        assert!(validate_options(&sim_options(), Purpose::Scan).is_ok());
    }

    #[test]
    fn numeric_ranges_are_enforced() {
        let mut options = sim_options();
        options.dpi = 0;
        assert!(validate_options(&options, Purpose::Scan).is_err());

        let mut options = sim_options();
        options.dpi = MAX_DPI + 1;
        assert!(validate_options(&options, Purpose::Scan).is_err());

        let mut options = sim_options();
        options.quality = Some(101);
        assert!(validate_options(&options, Purpose::Scan).is_err());

        let mut options = sim_options();
        options.thumbnail_size = Some(32);
        assert!(validate_options(&options, Purpose::Scan).is_err());
        options.thumbnail_size = Some(256);
        assert!(validate_options(&options, Purpose::Scan).is_ok());
    }

    #[test]
    fn x86_architecture_needs_twain() {
        let mut options = sim_options();
        options.driver_arch = DriverArch::X86;
        assert!(validate_options(&options, Purpose::Scan).is_err());
    }

    #[cfg(not(windows))]
    #[test]
    fn twain_is_windows_only() {
        let options = ScanOptions::for_driver(Driver::Twain);
        assert!(validate_options(&options, Purpose::DeviceList).is_err());
    }
}
