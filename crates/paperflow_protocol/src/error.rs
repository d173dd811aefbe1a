use thiserror::Error;

use crate::OpCode;

/// Errors raised while framing or decoding worker channel messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("protocol version mismatch: expected {expected:#04x}, got {got:#04x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unexpected message {got:?} while waiting for {expected}")]
    UnexpectedMessage { expected: &'static str, got: OpCode },

    #[error("invalid image payload: {0}")]
    InvalidImage(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
