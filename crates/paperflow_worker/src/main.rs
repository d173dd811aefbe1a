//! Paperflow worker host
//!
//! Usage:
//!     paperflow-worker [worker] <parent-pid>

use clap::Parser;
use paperflow_logging::{init_logging, Console, LogSettings};
use paperflow_worker::{run_from_args, DriverRegistry, WorkerArgs};

#[tokio::main]
async fn main() {
    let args = WorkerArgs::parse();

    let settings = LogSettings::from_env().unwrap_or_else(|e| {
        eprintln!("warning: {:#}; using default log settings", e);
        LogSettings::default()
    });
    let console = if args.verbose {
        Console::Verbose
    } else {
        Console::WarningsOnly
    };
    let app_name = format!("worker-{}", std::process::id());
    if let Err(e) = init_logging(&app_name, &settings.with_console(console)) {
        eprintln!("warning: logging disabled: {:#}", e);
    }

    let code = match run_from_args(&args.launch, DriverRegistry::with_builtin()).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("Worker failed: {:#}", e);
            1
        }
    };

    // The lifeline reader may still be parked on stdin.
    std::process::exit(code);
}
