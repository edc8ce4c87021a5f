//! Firmware parsing and programming errors

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::FlashFileFormat;
use crate::config::ConfigError;
use crate::uds::UdsError;

/// A firmware container could not be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashParseError {
    #[error("Empty input")]
    Empty,

    #[error("Input is not text")]
    NotText,

    #[error("Line {line}: missing record start '{expected}'")]
    MissingStartCode { line: usize, expected: char },

    #[error("Line {line}: record truncated")]
    Truncated { line: usize },

    #[error("Line {line}: invalid hex character '{character}'")]
    InvalidHex { line: usize, character: char },

    #[error("Line {line}: byte count {count} does not match record length {actual}")]
    LengthMismatch {
        line: usize,
        count: usize,
        actual: usize,
    },

    #[error("Line {line}: checksum 0x{actual:02X}, expected 0x{expected:02X}")]
    ChecksumMismatch { line: usize, expected: u8, actual: u8 },

    #[error("Line {line}: unsupported record type {record_type}")]
    UnsupportedRecord { line: usize, record_type: String },

    #[error("Line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("No data records")]
    NoData,
}

impl FlashParseError {
    /// Map a `hex` decoding failure on `line`
    pub(crate) fn from_hex(line: usize, err: hex::FromHexError) -> Self {
        match err {
            hex::FromHexError::InvalidHexCharacter { c, .. } => {
                FlashParseError::InvalidHex { line, character: c }
            }
            _ => FlashParseError::Truncated { line },
        }
    }
}

/// Failures of a flash operation; transfer failures carry the address
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] FlashParseError),

    #[error("Unsupported flash file format: {0}")]
    UnsupportedFormat(FlashFileFormat),

    #[error("Invalid flash file: {0}")]
    InvalidFile(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to enter programming session")]
    BootloaderEntryFailed,

    #[error("Security access denied at level 0x{0:02X}")]
    SecurityAccessDenied(u8),

    #[error("Address 0x{address:08X} is not inside a configured region")]
    InvalidAddress { address: u32 },

    #[error("Region '{name}' containing 0x{address:08X} is write protected")]
    RegionProtected { name: String, address: u32 },

    #[error("Erase failed at 0x{address:08X}")]
    EraseFailed { address: u32 },

    #[error("Programming failed at 0x{address:08X}: {reason}")]
    ProgrammingFailed { address: u32, reason: String },

    #[error("Verification failed at 0x{address:08X}")]
    VerificationFailed { address: u32 },

    #[error("Read failed at 0x{address:08X}: {reason}")]
    ReadFailed { address: u32, reason: String },

    #[error("Transfer at 0x{address:08X} failed: {source}")]
    Transfer {
        address: u32,
        #[source]
        source: UdsError,
    },

    #[error("Flash operation exceeded {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Uds(#[from] UdsError),
}

impl FlashError {
    /// Address the operation failed at, when there is one
    pub fn address(&self) -> Option<u32> {
        match self {
            FlashError::InvalidAddress { address }
            | FlashError::RegionProtected { address, .. }
            | FlashError::EraseFailed { address }
            | FlashError::ProgrammingFailed { address, .. }
            | FlashError::VerificationFailed { address }
            | FlashError::ReadFailed { address, .. }
            | FlashError::Transfer { address, .. } => Some(*address),
            _ => None,
        }
    }
}
