//! Devices command - list scanners reachable through a driver

use crate::cli::output::print_table;
use paperflow::{Driver, DriverRegistry, ScanOptions, ScanningConfig};

#[derive(Debug)]
pub struct DevicesArgs {
    pub driver: Driver,
    pub use_worker: bool,
    pub json: bool,
}

pub async fn run(args: DevicesArgs, config: ScanningConfig) -> anyhow::Result<()> {
    let controller = config.build_controller(DriverRegistry::with_builtin())?;

    let mut options = ScanOptions::for_driver(args.driver);
    options.use_worker = args.use_worker;
    let result = controller.get_device_list(&options).await;
    controller.shutdown().await;
    let devices = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No {} devices found.", options.driver.resolve());
        return Ok(());
    }

    let rows = devices
        .iter()
        .map(|d| vec![d.driver.to_string(), d.id.clone(), d.name.clone()])
        .collect();
    print_table(&["DRIVER", "ID", "NAME"], rows);
    Ok(())
}
