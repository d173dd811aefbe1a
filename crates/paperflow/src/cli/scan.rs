//! Scan command - acquire pages and save them to a folder

use crate::cli::output::{format_size, print_table, progress_bar};
use anyhow::Context;
use futures::StreamExt;
use paperflow::{
    BitDepth, CancellationToken, Driver, DriverRegistry, PaperSource, ScanDevice, ScanEvent,
    ScanOptions, ScanningConfig,
};
use paperflow_protocol::defaults::DEFAULT_JPEG_QUALITY;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug)]
pub struct ScanArgs {
    pub device: String,
    pub driver: Driver,
    pub output: PathBuf,
    pub dpi: u32,
    pub bit_depth: BitDepth,
    pub paper_source: PaperSource,
    pub use_worker: bool,
    pub max_quality: bool,
    pub quality: Option<u8>,
    pub thumbnail_size: Option<u32>,
}

pub async fn run(args: ScanArgs, config: ScanningConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create output folder: {}", args.output.display()))?;

    let controller = config.build_controller(DriverRegistry::with_builtin())?;
    controller.events().subscribe(|event| match event {
        ScanEvent::PageStart { page } => eprintln!("Page {}...", page),
        ScanEvent::PageProgress { page, progress } => {
            eprintln!("Page {} {}", page, progress_bar(*progress, 20))
        }
        ScanEvent::ScanError { message, .. } => eprintln!("Error: {}", message),
        _ => {}
    });

    let mut options = ScanOptions::for_driver(args.driver)
        .with_device(ScanDevice::new(args.driver, &args.device, &args.device));
    options.dpi = args.dpi;
    options.bit_depth = args.bit_depth;
    options.paper_source = args.paper_source;
    options.use_worker = args.use_worker;
    options.max_quality = args.max_quality;
    options.quality = args.quality;
    options.thumbnail_size = args.thumbnail_size;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current page");
            ctrl_c.cancel();
        }
    });

    let result = save_pages(&controller, &options, &args, cancel).await;
    controller.shutdown().await;
    let rows = result?;

    if rows.is_empty() {
        println!("No pages scanned.");
    } else {
        print_table(&["PAGE", "FILE", "SIZE", "DIMENSIONS"], rows);
    }
    Ok(())
}

async fn save_pages(
    controller: &paperflow::ScanController,
    options: &ScanOptions,
    args: &ScanArgs,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<Vec<String>>> {
    let mut pages = controller.scan(options, cancel)?;
    let quality = args.quality.unwrap_or(DEFAULT_JPEG_QUALITY);

    let mut rows = Vec::new();
    while let Some(next) = pages.next().await {
        let image = next?;
        let rendered = image.render()?;
        let metadata = image.metadata();
        let encoded = rendered.encode_smallest(metadata.bit_depth, metadata.lossless, quality)?;
        let page = rows.len() + 1;
        let path = args
            .output
            .join(format!("page-{:03}.{}", page, encoded.extension()));
        fs::write(&path, &encoded.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("[Scan] Saved page {} to {}", page, path.display());

        rows.push(vec![
            page.to_string(),
            path.display().to_string(),
            format_size(encoded.bytes.len() as u64),
            format!("{}x{}", rendered.width(), rendered.height()),
        ]);
        image.dispose();
    }
    Ok(rows)
}
