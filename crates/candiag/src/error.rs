//! Crate-wide error type

use thiserror::Error;

use crate::can::TransportError;
use crate::config::ConfigError;
use crate::correlator::CorrelatorError;
use crate::flash::{FlashError, FlashParseError};
use crate::message::MessageError;
use crate::obd::ObdError;
use crate::pool::PoolError;
use crate::uds::UdsError;

/// Result type for operations spanning several layers
pub type Result<T> = std::result::Result<T, Error>;

/// Any error of the diagnostic stack
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Obd(#[from] ObdError),

    #[error(transparent)]
    FlashParse(#[from] FlashParseError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Recoverable by retrying: the peer did not answer in time
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Correlator(CorrelatorError::Timeout(_))
                | Error::Uds(UdsError::Timeout(_))
                | Error::Obd(ObdError::Timeout(_))
                | Error::Flash(FlashError::Timeout(_))
                | Error::Flash(FlashError::Transfer {
                    source: UdsError::Timeout(_),
                    ..
                })
        )
    }
}
