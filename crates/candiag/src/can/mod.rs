//! CAN transport layer
//!
//! Frame and filter model plus the [`CanTransport`] trait the diagnostic
//! clients are built on:
//! - [`CanFrame`] / [`CanFilter`] value types
//! - identifier and bit-rate helpers
//! - [`MockTransport`] for testing and simulation
//!
//! # Example
//!
//! ```ignore
//! use candiag::can::{CanFrame, CanTransport, MockTransport};
//! use candiag::config::CanConfig;
//!
//! let transport = MockTransport::new(&CanConfig::default());
//! let mut rx = transport.subscribe();
//! transport.send(&CanFrame::new(0x7DF, &[0x01, 0x0C])).await?;
//! let reply = rx.recv().await?;
//! ```

pub mod error;
mod filter;
mod frame;
pub mod mock;
mod transport;

pub use error::TransportError;
pub use filter::{CanFilter, FilterTable};
pub use frame::{
    can_id_to_string, is_standard_bitrate, is_valid_can_id, parse_can_id, CanFrame,
    MAX_CLASSIC_PAYLOAD, MAX_EXTENDED_ID, MAX_SEGMENTED_PAYLOAD, MAX_STANDARD_ID,
    STANDARD_BITRATES,
};
pub use mock::{FrameResponder, MockTransport};
pub use transport::{check_frame, BusCounters, BusStatistics, CanTransport};

#[cfg(test)]
pub use transport::MockCanTransport;
