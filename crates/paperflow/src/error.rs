//! Error taxonomy of the scanning core.

use paperflow_protocol::ProtocolError;
use paperflow_worker::{DriverError, WorkerError};
use thiserror::Error;

/// Coarse classification of a [`ScanError`], carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Startup,
    ProcessGroup,
    Protocol,
    Channel,
    Driver,
    Validation,
    Io,
    Image,
    ForcedAbort,
    Internal,
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// Pool not initialized, executable missing, no pool for a worker route.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker startup failed: {0}")]
    Startup(String),

    #[error("process group error: {0}")]
    ProcessGroup(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    #[error("worker channel error: {0}")]
    Channel(String),

    /// Device or driver fault during enumeration or scanning.
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("invalid scan options: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("worker {pid} was forcibly aborted: {reason}")]
    ForcedAbort { pid: u32, reason: String },

    /// A pipeline task panicked or was cancelled by the runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::Configuration(_) => ErrorKind::Configuration,
            ScanError::Startup(_) => ErrorKind::Startup,
            ScanError::ProcessGroup(_) => ErrorKind::ProcessGroup,
            ScanError::Protocol(_) => ErrorKind::Protocol,
            ScanError::Channel(_) => ErrorKind::Channel,
            ScanError::Driver(_) => ErrorKind::Driver,
            ScanError::Validation(_) => ErrorKind::Validation,
            ScanError::Io(_) => ErrorKind::Io,
            ScanError::Image(_) | ScanError::InvalidImage(_) => ErrorKind::Image,
            ScanError::ForcedAbort { .. } => ErrorKind::ForcedAbort,
            ScanError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ScanError::Validation(message.into())
    }
}

impl From<WorkerError> for ScanError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::NotInitialized
            | WorkerError::NotConfigured(_)
            | WorkerError::ExecutableMissing(_) => ScanError::Configuration(err.to_string()),
            WorkerError::Spawn(_)
            | WorkerError::StartupFailed
            | WorkerError::Handshake(_)
            | WorkerError::HandshakeTimeout(_) => ScanError::Startup(err.to_string()),
            WorkerError::ProcessGroup { .. } => ScanError::ProcessGroup(err.to_string()),
            WorkerError::Channel(ProtocolError::ChannelClosed | ProtocolError::Io(_))
            | WorkerError::Connect { .. }
            | WorkerError::PoolClosed => ScanError::Channel(err.to_string()),
            WorkerError::Channel(_) => ScanError::Protocol(err.to_string()),
            WorkerError::Driver(driver) => ScanError::Driver(driver),
            WorkerError::ForcedAbort { pid, reason } => ScanError::ForcedAbort { pid, reason },
        }
    }
}

impl From<ProtocolError> for ScanError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidImage(message) => ScanError::InvalidImage(message),
            other => ScanError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paperflow_protocol::WorkerType;

    #[test]
    fn worker_errors_keep_their_classification() {
        let err: ScanError = WorkerError::ExecutableMissing("/nope".into()).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err: ScanError = WorkerError::NotConfigured(WorkerType::WinX86).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err: ScanError = WorkerError::Handshake("hello".into()).into();
        assert_eq!(err.kind(), ErrorKind::Startup);

        let err: ScanError = WorkerError::Channel(ProtocolError::ChannelClosed).into();
        assert_eq!(err.kind(), ErrorKind::Channel);

        let err: ScanError = WorkerError::Channel(ProtocolError::InvalidOpCode(99)).into();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err: ScanError = WorkerError::ForcedAbort {
            pid: 3,
            reason: "cancel ignored".into(),
        }
        .into();
        assert!(matches!(err, ScanError::ForcedAbort { pid: 3, .. }));
    }

    #[test]
    fn driver_faults_stay_typed() {
        let err: ScanError =
            WorkerError::Driver(DriverError::NoPages("feeder empty".into())).into();
        assert!(matches!(err, ScanError::Driver(DriverError::NoPages(_))));
        assert_eq!(err.to_string(), "no pages available: feeder empty");
    }
}
