//! Concurrent TFTP server engine.
//!
//! Implements RFC 1350 (revision 2) with option negotiation per RFC 2347 and
//! the `blksize` (RFC 2348), `timeout` and `tsize` (RFC 2349) options. The
//! server runs a single dispatcher on the well-known port and hands every
//! transfer to a worker that owns its own ephemeral UDP endpoint.

pub mod audit;
pub mod buffer_pool;
pub mod config;
pub mod error;
pub mod packet;
pub mod path;
pub mod server;
pub mod storage;
pub mod validation;

pub(crate) mod session;
pub(crate) mod worker_pool;

pub use config::TftpConfig;
pub use error::{Result, TftpError};
pub use packet::Packet;
pub use server::TftpServer;
pub use storage::{FsStorage, Storage, StorageError};

use std::time::Duration;

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const DEFAULT_TFTP_PORT: u16 = 69;
pub const BLOCK_SIZE: usize = 512; // fixed block size, RFC 1350
pub const MAX_DATA_SIZE: usize = 512;
pub const MAX_PACKET_SIZE: usize = 516; // 4-byte header + 512 data
pub const MIN_PACKET_SIZE: usize = 4;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const MAX_RETRIES: u32 = 5;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

// Hard limits applied while decoding adversarial input
pub const MAX_FILENAME_LEN: usize = 255;
pub const MAX_OPTION_NAME_LEN: usize = 64;
pub const MAX_OPTION_VALUE_LEN: usize = 64;
pub const MAX_ERROR_MESSAGE_LEN: usize = 255;
pub const MAX_STRING_LEN: usize = 255;
pub const MAX_OPTIONS_COUNT: usize = 16;

/// Default per-transfer payload cap (inside the validated 512 B ..= 1 GiB range).
pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 64 * 1024 * 1024;

// TFTP Opcodes (RFC 1350, RFC 2347)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read Request
    Wrq = 2,   // Write Request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
    Oack = 6,  // Option Acknowledgment (RFC 2347)
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

// TFTP Error Codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

// Transfer Mode (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// NETASCII mode. This server does not translate line endings; payload
    /// bytes pass through unmodified.
    Netascii,
    /// OCTET mode - binary transfer without conversion.
    Octet,
    /// MAIL mode - obsolete. Accepted on the wire, treated as octet.
    Mail,
}

impl TransferMode {
    /// Parse the wire representation (compared case-insensitively).
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::Decode(format!("unknown transfer mode: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

/// Direction of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}
