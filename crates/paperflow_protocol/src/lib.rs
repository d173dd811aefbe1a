//! Worker Channel Protocol
//!
//! Wire format for parent <-> worker communication over the per-worker
//! local channel (Unix domain socket or named pipe).
//!
//! # Wire Format
//!
//! Header Format: !BBHQI (16 bytes, Network Byte Order / Big Endian)
//! ```text
//! [VER:1][OP:1][RES:2][REQ_ID:8][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - REQ_ID (u64): Request id, echoed on every reply
//! - LEN (u32): JSON payload length in bytes

pub mod codec;
pub mod defaults;
pub mod error;
pub mod naming;
pub mod types;

pub use codec::{read_message, write_message};
pub use error::{ProtocolError, Result};
pub use naming::{channel_name, channel_path};
pub use types::{
    BitDepth, Driver, DriverArch, ErrorPayload, FaultKind, ImagePayload, InitRequest,
    PagePayload, PaperSource, PixelFormat, ProgressPayload, ScanDevice, ScanOptions, WorkerType,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest payload accepted from a peer (256 MB). A page at 600 dpi color
/// is well below this; anything larger is a broken or hostile peer.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Worker channel OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Parent -> Worker (Requests)
    Init = 1,          // "Here is the storage folder."
    GetDeviceList = 2, // "List devices for these options."
    Scan = 3,          // "Scan with these options."
    Cancel = 4,        // "Stop before the next page."

    // Worker -> Parent (Stream)
    PageStart = 5,
    Progress = 6,
    Page = 7,
    Device = 8,

    // Worker -> Parent (Completion)
    Done = 9,
    Err = 10,
    Ack = 11,
}

impl OpCode {
    /// Convert u8 to OpCode
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Unknown),
            1 => Ok(OpCode::Init),
            2 => Ok(OpCode::GetDeviceList),
            3 => Ok(OpCode::Scan),
            4 => Ok(OpCode::Cancel),
            5 => Ok(OpCode::PageStart),
            6 => Ok(OpCode::Progress),
            7 => Ok(OpCode::Page),
            8 => Ok(OpCode::Device),
            9 => Ok(OpCode::Done),
            10 => Ok(OpCode::Err),
            11 => Ok(OpCode::Ack),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    /// Convert OpCode to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub request_id: u64,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, request_id: u64, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            request_id,
            payload_len,
        }
    }

    /// Pack header into 16-byte buffer
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.request_id)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from 16-byte buffer
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let request_id = cursor.read_u64::<BigEndian>()?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            request_id,
            payload_len,
        })
    }
}

/// Protocol message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message
    ///
    /// Returns an error if payload exceeds MAX_PAYLOAD_SIZE.
    pub fn new(opcode: OpCode, request_id: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, request_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Message without a payload (Cancel, Done, Ack, PageStart).
    pub fn empty(opcode: OpCode, request_id: u64) -> Self {
        Self {
            header: Header::new(opcode, request_id, 0),
            payload: Vec::new(),
        }
    }

    /// Message with a JSON-encoded payload.
    pub fn json<T: Serialize>(opcode: OpCode, request_id: u64, value: &T) -> Result<Self> {
        Self::new(opcode, request_id, serde_json::to_vec(value)?)
    }

    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_unpack() {
        let header = Header::new(OpCode::Scan, 12345, 1024);
        let packed = header.pack().unwrap();

        assert_eq!(packed.len(), HEADER_SIZE);

        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.version, PROTOCOL_VERSION);
        assert_eq!(unpacked.opcode, OpCode::Scan);
        assert_eq!(unpacked.request_id, 12345);
        assert_eq!(unpacked.payload_len, 1024);
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xFF;

        let result = Header::unpack(&buf);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch { .. })));
    }

    #[test]
    fn test_header_too_short() {
        let buf = [0u8; 8];
        let result = Header::unpack(&buf);
        assert!(matches!(result, Err(ProtocolError::HeaderTooShort { .. })));
    }

    #[test]
    fn test_invalid_opcode() {
        let mut packed = Header::new(OpCode::Ack, 1, 0).pack().unwrap();
        packed[1] = 0x7F;
        assert!(matches!(
            Header::unpack(&packed),
            Err(ProtocolError::InvalidOpCode(0x7F))
        ));
    }

    #[test]
    fn test_json_message_decodes() {
        let request = InitRequest {
            storage_folder: Some("/tmp/pages".into()),
        };
        let msg = Message::json(OpCode::Init, 7, &request).unwrap();
        assert_eq!(msg.opcode(), OpCode::Init);
        assert_eq!(msg.header.payload_len as usize, msg.payload.len());

        let decoded: InitRequest = msg.decode().unwrap();
        assert_eq!(decoded.storage_folder, request.storage_folder);
    }
}
