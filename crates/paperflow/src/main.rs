//! Paperflow command line
//!
//! - `paperflow devices` lists scanners
//! - `paperflow scan` acquires pages into a folder
//! - `paperflow worker <ppid>` hosts drivers for a parent process

use anyhow::Context;
use clap::{Parser, Subcommand};
use paperflow::{BitDepth, Console, Driver, DriverRegistry, PaperSource, ScanningConfig};
use paperflow_logging::init_logging;
use paperflow_protocol::defaults::DEFAULT_DPI;
use paperflow_worker::{run_worker, WorkerServiceConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "paperflow", about = "Document scanning with isolated driver workers")]
struct Cli {
    /// Enable verbose logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Keep pages as backing files in this folder instead of memory
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Executable hosting native workers (default: this binary)
    #[arg(long, global = true)]
    worker_exe: Option<PathBuf>,

    /// Executable hosting 32-bit workers
    #[arg(long, global = true)]
    worker_x86_exe: Option<PathBuf>,

    /// Start one spare worker per type up front
    #[arg(long, global = true)]
    spare_workers: bool,

    /// Kill a worker that does not answer within this many seconds
    #[arg(long, global = true)]
    rpc_timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices reachable through a driver
    Devices {
        /// Driver family (default, wia, twain, sane, escl, apple, sim)
        #[arg(short, long, default_value = "default")]
        driver: Driver,

        /// Enumerate inside a worker process
        #[arg(long)]
        use_worker: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Scan pages into a folder
    Scan {
        /// Device id as listed by `devices`
        device: String,

        #[arg(short, long, default_value = "default")]
        driver: Driver,

        /// Folder receiving page-NNN.{png,jpg}
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[arg(long, default_value_t = DEFAULT_DPI)]
        dpi: u32,

        /// color, grayscale or bw
        #[arg(long, default_value = "color")]
        bit_depth: BitDepth,

        /// auto, flatbed, feeder or duplex
        #[arg(long, default_value = "auto")]
        source: PaperSource,

        /// Scan inside a worker process
        #[arg(long)]
        use_worker: bool,

        /// Store pages losslessly
        #[arg(long)]
        max_quality: bool,

        /// JPEG quality (0-100)
        #[arg(long)]
        quality: Option<u8>,

        /// Render thumbnails of this size
        #[arg(long)]
        thumbnail_size: Option<u32>,

        /// Fail the command on the first scan error
        #[arg(long)]
        strict: bool,
    },

    /// Host drivers for a parent process (internal)
    #[command(hide = true)]
    Worker {
        parent_pid: u32,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let is_worker = matches!(cli.command, Commands::Worker { .. });

    let config = match scanning_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    let (app_name, console) = if is_worker {
        (format!("worker-{}", std::process::id()), Console::WarningsOnly)
    } else if cli.verbose {
        ("paperflow".to_string(), Console::Verbose)
    } else {
        ("paperflow".to_string(), Console::Normal)
    };
    if let Err(e) = init_logging(&app_name, &config.logging.clone().with_console(console)) {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return ExitCode::from(1);
        }
    };
    let result = runtime.block_on(run_command(cli, config));

    if is_worker {
        // The lifeline reader may still be parked on stdin.
        let code = match &result {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("Worker failed: {:#}", e);
                1
            }
        };
        std::process::exit(code);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:?}", err);
            ExitCode::from(1)
        }
    }
}

fn scanning_config(cli: &Cli) -> anyhow::Result<ScanningConfig> {
    let mut config = ScanningConfig::from_env().context("Invalid PAPERFLOW_* environment")?;
    if let Some(dir) = &cli.storage_dir {
        config.storage_folder = Some(dir.clone());
    }
    if let Some(exe) = &cli.worker_exe {
        config.worker_executable = Some(exe.clone());
    }
    if let Some(exe) = &cli.worker_x86_exe {
        config.x86_worker_executable = Some(exe.clone());
    }
    if cli.spare_workers {
        config.start_spare_workers = true;
    }
    if let Some(secs) = cli.rpc_timeout_secs {
        config.rpc_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    Ok(config)
}

async fn run_command(cli: Cli, mut config: ScanningConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker { parent_pid } => {
            run_worker(WorkerServiceConfig {
                parent_pid,
                drivers: DriverRegistry::with_builtin(),
            })
            .await
        }
        Commands::Devices {
            driver,
            use_worker,
            json,
        } => {
            cli::devices::run(
                cli::devices::DevicesArgs {
                    driver,
                    use_worker,
                    json,
                },
                config,
            )
            .await
        }
        Commands::Scan {
            device,
            driver,
            output,
            dpi,
            bit_depth,
            source,
            use_worker,
            max_quality,
            quality,
            thumbnail_size,
            strict,
        } => {
            config.propagate_errors = strict;
            cli::scan::run(
                cli::scan::ScanArgs {
                    device,
                    driver,
                    output,
                    dpi,
                    bit_depth,
                    paper_source: source,
                    use_worker,
                    max_quality,
                    quality,
                    thumbnail_size,
                },
                config,
            )
            .await
        }
    }
}
