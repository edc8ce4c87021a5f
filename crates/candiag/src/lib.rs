//! candiag - UDS / OBD-II diagnostics and flash programming over CAN
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  FlashManager ── FlashFile (Intel HEX / S-Record / binary)   │
//! │        │                                                     │
//! │  ┌─────┴──────┐                     ┌────────────┐           │
//! │  │ UdsClient  │                     │ ObdClient  │           │
//! │  │ (ISO 14229)│                     │ (SAE J1979)│           │
//! │  └─────┬──────┘                     └─────┬──────┘           │
//! │        │ Correlator (one pending slot per client)            │
//! │        └──────────────┬───────────────────┘                  │
//! │                ┌──────┴───────┐                              │
//! │                │ CanTransport │  MockTransport + SimulatedEcu│
//! │                └──────────────┘                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Clients take an `Arc<dyn CanTransport>` and their config struct at
//! construction; nothing reads global state.

pub mod can;
pub mod config;
pub mod correlator;
pub mod dtc;
pub mod error;
pub mod flash;
pub mod message;
pub mod obd;
pub mod pool;
pub mod sim;
pub mod uds;

pub use can::{CanFilter, CanFrame, CanTransport, MockTransport, TransportError};
pub use config::{
    CanConfig, ConfigError, DiagConfig, FlashConfig, ObdConfig, PoolConfig, UdsConfig,
};
pub use correlator::{CorrelationState, Correlator, CorrelatorError, ResponseMatcher};
pub use dtc::{decode_dtc, encode_dtc, Dtc, DtcCategory};
pub use error::{Error, Result};
pub use flash::{
    FlashBlock, FlashError, FlashFile, FlashFileFormat, FlashManager, FlashProgress,
    FlashRegion, FlashStatistics,
};
pub use message::DiagnosticMessage;
pub use obd::{ObdClient, ObdError, ObdMode, Parameter};
pub use pool::{PoolError, WorkerPool};
pub use sim::{SimConfig, SimulatedEcu};
pub use uds::{
    NegativeResponseCode, ResetType, SessionType, UdsClient, UdsError, UdsStatistics,
};
