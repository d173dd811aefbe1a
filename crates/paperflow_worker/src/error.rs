use paperflow_protocol::{ErrorPayload, FaultKind, ProtocolError, WorkerType};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Driver faults
// ============================================================================

/// Device or driver fault raised during enumeration or scanning.
///
/// These travel across the worker channel as an [`ErrorPayload`] and are
/// rebuilt on the parent side, so the classification survives the hop.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("no pages available: {0}")]
    NoPages(String),

    #[error("driver not available in this host: {0}")]
    Unsupported(String),

    #[error("driver fault: {0}")]
    Fault(String),

    /// The consumer of scan updates went away. Drivers propagate it with `?`
    /// and callers treat it as an early stop, not as a fault.
    #[error("scan consumer disconnected")]
    Disconnected,
}

impl DriverError {
    pub fn kind(&self) -> FaultKind {
        match self {
            DriverError::DeviceNotFound(_) => FaultKind::DeviceNotFound,
            DriverError::DeviceOffline(_) => FaultKind::DeviceOffline,
            DriverError::NoPages(_) => FaultKind::NoPages,
            DriverError::Unsupported(_) => FaultKind::Unsupported,
            DriverError::Fault(_) => FaultKind::Driver,
            DriverError::Disconnected => FaultKind::Internal,
        }
    }

    /// Message without the variant prefix, for the wire.
    fn detail(&self) -> String {
        match self {
            DriverError::DeviceNotFound(m)
            | DriverError::DeviceOffline(m)
            | DriverError::NoPages(m)
            | DriverError::Unsupported(m)
            | DriverError::Fault(m) => m.clone(),
            DriverError::Disconnected => "scan consumer disconnected".to_string(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.detail(),
        }
    }

    pub fn from_payload(payload: ErrorPayload) -> Self {
        match payload.kind {
            FaultKind::DeviceNotFound => DriverError::DeviceNotFound(payload.message),
            FaultKind::DeviceOffline => DriverError::DeviceOffline(payload.message),
            FaultKind::NoPages => DriverError::NoPages(payload.message),
            FaultKind::Unsupported => DriverError::Unsupported(payload.message),
            FaultKind::Driver | FaultKind::Internal => DriverError::Fault(payload.message),
        }
    }
}

// ============================================================================
// Pool / process / channel errors
// ============================================================================

/// Errors from the worker pool, worker processes and their channels.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `create` was called before `init`.
    #[error("worker pool has not been initialized")]
    NotInitialized,

    #[error("no worker executable configured for {0} workers")]
    NotConfigured(WorkerType),

    #[error("worker executable does not exist: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("could not start worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The worker printed `error` as its handshake line.
    #[error("the worker could not start due to an error; see the worker logs")]
    StartupFailed,

    /// The worker printed something other than `ready`/`error`, or exited.
    #[error("unknown problem starting the worker: unexpected handshake {0:?}")]
    Handshake(String),

    #[error("worker did not complete its handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("could not attach worker {pid} to the parent's lifetime: {source}")]
    ProcessGroup {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to worker channel {name}: {source}")]
    Connect {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker channel error: {0}")]
    Channel(#[from] ProtocolError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The worker had to be killed because it stopped responding or ignored
    /// a cancel request. Reported as a fault, never as a clean cancellation.
    #[error("worker {pid} was forcibly aborted: {reason}")]
    ForcedAbort { pid: u32, reason: String },

    #[error("worker pool has been disposed")]
    PoolClosed,
}

impl WorkerError {
    /// Misconfiguration of the caller; retrying will not help.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WorkerError::NotInitialized
                | WorkerError::NotConfigured(_)
                | WorkerError::ExecutableMissing(_)
        )
    }

    /// The worker process failed to come up.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            WorkerError::Spawn(_)
                | WorkerError::StartupFailed
                | WorkerError::Handshake(_)
                | WorkerError::HandshakeTimeout(_)
        )
    }
}
