//! Worker processes for hosting scanner drivers out of process.
//!
//! The parent side leases workers from a [`WorkerPool`] and talks to them
//! through a [`WorkerServiceAdapter`]; the worker side runs
//! [`service::run_worker`].

pub mod cancel;
pub mod channel;
pub mod driver;
pub mod error;
pub mod pool;
pub mod process;
pub mod service;
pub mod sim;
pub mod transport;

pub use cancel::CancellationToken;
pub use channel::{ChannelTimeouts, WorkerServiceAdapter, DEFAULT_CANCEL_GRACE};
pub use driver::{DriverRegistry, ScanDriver, ScanEventSink, ScanUpdate, UpdateSink};
pub use error::{DriverError, WorkerError};
pub use pool::{PoolInitOptions, WorkerContext, WorkerPool, WorkerPoolConfig};
pub use process::{launch_args, ParentLifetimeGroup, ProcessGroup};
pub use service::{parse_parent_pid, run_worker, serve_connection, WorkerServiceConfig};
pub use sim::SimulatedDriver;

#[derive(clap::Parser, Debug)]
#[command(name = "paperflow-worker", about = "Scanner driver host for Paperflow")]
pub struct WorkerArgs {
    /// Optional `worker` marker followed by the parent process id
    #[arg(value_name = "[worker] PARENT_PID", num_args = 1..=2, required = true)]
    pub launch: Vec<String>,

    /// Mirror the full log filter on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

/// Host drivers for the parent named in `launch` until it goes away.
pub async fn run_from_args(launch: &[String], drivers: DriverRegistry) -> anyhow::Result<()> {
    let parent_pid = parse_parent_pid(launch).map_err(anyhow::Error::msg)?;
    run_worker(WorkerServiceConfig {
        parent_pid,
        drivers,
    })
    .await
}
