//! Pool of pre-started worker processes.
//!
//! Every `create` starts a replacement before taking a worker from the
//! queue, so after the first request one spare per worker type is warm.
//! Workers are single-use: the caller disposes them after one operation.

use paperflow_protocol::WorkerType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::{ChannelTimeouts, WorkerServiceAdapter};
use crate::error::WorkerError;
use crate::process::{
    start_worker_process, ParentLifetimeGroup, ProcessGroup, WorkerLaunch,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::transport;

/// Started workers waiting to be taken, per type.
const QUEUE_CAPACITY: usize = 8;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Executable hosting native workers (usually the main executable).
    pub native_executable: Option<PathBuf>,
    /// Dedicated 32-bit worker host.
    pub x86_executable: Option<PathBuf>,
    pub handshake_timeout: Duration,
    /// Extra environment variables for every worker.
    pub environment: HashMap<String, String>,
    pub channel: ChannelTimeouts,
    /// Sent to each worker in its Init request.
    pub storage_folder: Option<PathBuf>,
    pub process_group: Arc<dyn ProcessGroup>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            native_executable: None,
            x86_executable: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            environment: HashMap::new(),
            channel: ChannelTimeouts::default(),
            storage_folder: None,
            process_group: Arc::new(ParentLifetimeGroup),
        }
    }
}

impl WorkerPoolConfig {
    pub fn executable(&self, worker_type: WorkerType) -> Option<&Path> {
        match worker_type {
            WorkerType::Native => self.native_executable.as_deref(),
            WorkerType::WinX86 => self.x86_executable.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolInitOptions {
    /// Start one worker per configured type right away.
    pub start_spare_workers: bool,
}

/// A worker leased from the pool. Exclusively owned by one caller.
#[derive(Debug)]
pub struct WorkerContext {
    worker_type: WorkerType,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    service: WorkerServiceAdapter,
    ready_at: Instant,
    disposed: bool,
}

impl WorkerContext {
    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// When the worker completed its handshake.
    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }

    pub fn service(&mut self) -> &mut WorkerServiceAdapter {
        &mut self.service
    }

    /// Terminate the worker process and wait for it to exit.
    pub async fn dispose(mut self) {
        self.disposed = true;
        self.service.close();
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            debug!("[Worker {}] Already exited: {}", self.pid, e);
        }
        let _ = self.child.wait().await;
        transport::remove_channel(self.pid);
        debug!("[Worker {}] Disposed", self.pid);
    }
}

impl Drop for WorkerContext {
    fn drop(&mut self) {
        if !self.disposed {
            let _ = self.child.start_kill();
            transport::remove_channel(self.pid);
        }
    }
}

type QueueItem = Result<WorkerContext, WorkerError>;

struct WorkerQueue {
    tx: mpsc::Sender<QueueItem>,
    rx: Mutex<mpsc::Receiver<QueueItem>>,
    ready: AtomicUsize,
}

impl WorkerQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(rx),
            ready: AtomicUsize::new(0),
        }
    }
}

pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    parent_pid: u32,
    queues: OnceLock<HashMap<WorkerType, Arc<WorkerQueue>>>,
    closed: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config: Arc::new(config),
            parent_pid: std::process::id(),
            queues: OnceLock::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Prepare the pool. Idempotent; later calls are no-ops.
    ///
    /// Must be called from within a tokio runtime when spares are requested.
    pub fn init(&self, options: PoolInitOptions) {
        let mut first = false;
        let queues = self.queues.get_or_init(|| {
            first = true;
            WorkerType::ALL
                .iter()
                .map(|t| (*t, Arc::new(WorkerQueue::new())))
                .collect()
        });
        if !first {
            debug!("Worker pool already initialized");
            return;
        }
        info!(
            "Worker pool initialized (spare workers: {})",
            options.start_spare_workers
        );

        if !options.start_spare_workers {
            return;
        }
        for worker_type in WorkerType::ALL {
            match self.config.executable(worker_type) {
                Some(path) if path.exists() => {
                    if let Some(queue) = queues.get(&worker_type) {
                        self.spawn_worker(worker_type, Arc::clone(queue));
                    }
                }
                Some(path) => warn!(
                    "Not starting a spare {} worker: {} does not exist",
                    worker_type,
                    path.display()
                ),
                None => debug!("No {} worker executable configured", worker_type),
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.queues.get().is_some()
    }

    /// Number of started workers of `worker_type` waiting in the queue.
    pub fn ready_workers(&self, worker_type: WorkerType) -> usize {
        self.queues
            .get()
            .and_then(|queues| queues.get(&worker_type))
            .map(|queue| queue.ready.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Lease a started and initialized worker.
    pub async fn create(&self, worker_type: WorkerType) -> Result<WorkerContext, WorkerError> {
        let queues = self.queues.get().ok_or(WorkerError::NotInitialized)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::PoolClosed);
        }
        let executable = self
            .config
            .executable(worker_type)
            .ok_or(WorkerError::NotConfigured(worker_type))?;
        if !executable.exists() {
            return Err(WorkerError::ExecutableMissing(executable.to_path_buf()));
        }
        let queue = queues
            .get(&worker_type)
            .ok_or(WorkerError::NotConfigured(worker_type))?;

        self.spawn_worker(worker_type, Arc::clone(queue));

        let next = {
            let mut rx = queue.rx.lock().await;
            rx.recv().await.ok_or(WorkerError::PoolClosed)?
        };
        let mut worker = next?;
        queue.ready.fetch_sub(1, Ordering::SeqCst);

        let storage_folder = self.config.storage_folder.clone();
        if let Err(e) = worker.service().init(storage_folder.as_deref()).await {
            warn!("[Worker {}] Init failed: {}", worker.pid(), e);
            worker.dispose().await;
            return Err(e);
        }
        debug!("[Worker {}] Leased ({})", worker.pid(), worker_type);
        Ok(worker)
    }

    /// Stop producing workers and terminate every queued one.
    ///
    /// Starts still in flight find the queue closed and dispose their
    /// worker themselves.
    pub async fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(queues) = self.queues.get() else {
            return;
        };
        for (worker_type, queue) in queues {
            let mut rx = queue.rx.lock().await;
            rx.close();
            while let Ok(item) = rx.try_recv() {
                if let Ok(worker) = item {
                    queue.ready.fetch_sub(1, Ordering::SeqCst);
                    worker.dispose().await;
                }
            }
            debug!("Drained {} worker queue", worker_type);
        }
        info!("Worker pool disposed");
    }

    fn spawn_worker(&self, worker_type: WorkerType, queue: Arc<WorkerQueue>) {
        let config = Arc::clone(&self.config);
        let closed = Arc::clone(&self.closed);
        let parent_pid = self.parent_pid;

        tokio::spawn(async move {
            let result = start_worker(&config, worker_type, parent_pid).await;
            if let Err(e) = &result {
                warn!("Failed to start {} worker: {}", worker_type, e);
            }
            if closed.load(Ordering::SeqCst) {
                if let Ok(worker) = result {
                    worker.dispose().await;
                }
                // Wakes a `create` still waiting on this queue.
                let _ = queue.tx.try_send(Err(WorkerError::PoolClosed));
                return;
            }
            let started = result.is_ok();
            if started {
                queue.ready.fetch_add(1, Ordering::SeqCst);
            }
            if let Err(mpsc::error::SendError(item)) = queue.tx.send(result).await {
                if let Ok(worker) = item {
                    queue.ready.fetch_sub(1, Ordering::SeqCst);
                    worker.dispose().await;
                }
            }
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("initialized", &self.is_initialized())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

async fn start_worker(
    config: &WorkerPoolConfig,
    worker_type: WorkerType,
    parent_pid: u32,
) -> Result<WorkerContext, WorkerError> {
    let executable = config
        .executable(worker_type)
        .ok_or(WorkerError::NotConfigured(worker_type))?
        .to_path_buf();
    let launch = WorkerLaunch {
        worker_type,
        executable,
        parent_pid,
        handshake_timeout: config.handshake_timeout,
        environment: config.environment.clone(),
    };

    let mut started = start_worker_process(&launch, config.process_group.as_ref()).await?;
    let stream = match transport::connect(started.pid).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = started.child.start_kill();
            let _ = started.child.wait().await;
            transport::remove_channel(started.pid);
            return Err(e);
        }
    };

    Ok(WorkerContext {
        worker_type,
        pid: started.pid,
        service: WorkerServiceAdapter::new(started.pid, stream, config.channel),
        child: started.child,
        stdin: Some(started.stdin),
        ready_at: Instant::now(),
        disposed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_before_init_is_rejected() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        let err = pool.create(WorkerType::Native).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotInitialized));
    }

    #[tokio::test]
    async fn unconfigured_and_missing_executables_are_configuration_errors() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            native_executable: Some(PathBuf::from("/no/such/paperflow-worker")),
            ..WorkerPoolConfig::default()
        });
        pool.init(PoolInitOptions {
            start_spare_workers: true,
        });

        let err = pool.create(WorkerType::Native).await.unwrap_err();
        assert!(matches!(err, WorkerError::ExecutableMissing(_)));
        assert!(err.is_configuration());

        let err = pool.create(WorkerType::WinX86).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotConfigured(WorkerType::WinX86)));
        assert_eq!(pool.ready_workers(WorkerType::Native), 0);
    }

    #[tokio::test]
    async fn disposed_pool_refuses_new_workers() {
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        pool.init(PoolInitOptions::default());
        pool.init(PoolInitOptions::default());
        pool.dispose().await;
        let err = pool.create(WorkerType::Native).await.unwrap_err();
        assert!(matches!(err, WorkerError::PoolClosed));
    }
}
