//! UDS protocol errors

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::NegativeResponseCode;
use crate::can::TransportError;
use crate::correlator::CorrelatorError;
use crate::message::MessageError;
use crate::pool::PoolError;

/// Infrastructure failures; negative responses are not errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Response timeout after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<CorrelatorError> for UdsError {
    fn from(err: CorrelatorError) -> Self {
        match err {
            CorrelatorError::Timeout(after) => UdsError::Timeout(after),
            CorrelatorError::Transport(e) => UdsError::Transport(e),
        }
    }
}

impl From<MessageError> for UdsError {
    fn from(err: MessageError) -> Self {
        UdsError::InvalidResponse(err.to_string())
    }
}

/// Detail of the most recent failed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub code: NegativeResponseCode,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(code: NegativeResponseCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}
