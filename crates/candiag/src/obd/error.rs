//! OBD-II errors

use std::time::Duration;

use thiserror::Error;

use crate::can::TransportError;
use crate::correlator::CorrelatorError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObdError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Empty response")]
    EmptyResponse,

    #[error("Invalid response SID 0x{actual:02X}, expected 0x{expected:02X}")]
    InvalidResponseSid { expected: u8, actual: u8 },

    #[error("Invalid response PID 0x{actual:02X}, expected 0x{expected:02X}")]
    InvalidResponsePid { expected: u8, actual: u8 },

    #[error("Response for PID 0x{pid:02X} too short ({len} bytes)")]
    Truncated { pid: u8, len: usize },

    #[error("Monitoring is already running")]
    AlreadyMonitoring,
}

impl From<CorrelatorError> for ObdError {
    fn from(err: CorrelatorError) -> Self {
        match err {
            CorrelatorError::Timeout(after) => ObdError::Timeout(after),
            CorrelatorError::Transport(e) => ObdError::Transport(e),
        }
    }
}
