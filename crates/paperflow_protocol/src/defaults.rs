//! Canonical default values shared by the parent process and worker hosts.

/// Handshake line a worker prints once its channel is listening.
pub const HANDSHAKE_READY: &str = "ready";
/// Handshake line a worker prints when it failed to initialise.
pub const HANDSHAKE_ERROR: &str = "error";

/// Argument that switches the main executable into native worker mode.
pub const WORKER_SUBCOMMAND: &str = "worker";

pub const CHANNEL_NAME_PREFIX: &str = "paperflow.worker";

pub const DEFAULT_DPI: u32 = 100;
pub const MIN_DPI: u32 = 1;
pub const MAX_DPI: u32 = 19_200;
pub const DEFAULT_JPEG_QUALITY: u8 = 75;
pub const MIN_THUMBNAIL_SIZE: u32 = 64;
pub const MAX_THUMBNAIL_SIZE: u32 = 1024;

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
