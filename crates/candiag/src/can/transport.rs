//! Transport trait and shared bookkeeping

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use super::{CanFilter, CanFrame, TransportError};

/// Counters kept by every transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStatistics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors_detected: u64,
    pub filters_applied: u64,
}

/// Mutex-guarded [`BusStatistics`]
#[derive(Debug, Default)]
pub struct BusCounters {
    inner: Mutex<BusStatistics>,
}

impl BusCounters {
    pub fn record_sent(&self) {
        self.inner.lock().frames_sent += 1;
    }

    pub fn record_received(&self) {
        self.inner.lock().frames_received += 1;
    }

    pub fn record_error(&self) {
        self.inner.lock().errors_detected += 1;
    }

    pub fn record_filter(&self) {
        self.inner.lock().filters_applied += 1;
    }

    pub fn snapshot(&self) -> BusStatistics {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = BusStatistics::default();
    }
}

/// Channel to a CAN bus
///
/// `send` hands one frame to the underlying channel and returns once the
/// channel accepted it. Received frames are pushed to every subscriber over a
/// broadcast channel; dropping the receiver unsubscribes. The transport knows
/// nothing about diagnostic protocols.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// Send a frame
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Subscribe to every frame received from now on
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Register an acceptance filter; `false` if it was already present
    fn add_filter(&self, filter: CanFilter) -> bool;

    /// Drop an acceptance filter; `false` if it was not present
    fn remove_filter(&self, filter: &CanFilter) -> bool;

    fn filters(&self) -> Vec<CanFilter>;

    fn statistics(&self) -> BusStatistics;

    fn is_connected(&self) -> bool;

    /// Largest payload a single `send` accepts
    fn max_payload(&self) -> usize;
}

/// Check a frame against the limits of a transport
pub fn check_frame(frame: &CanFrame, max_payload: usize) -> Result<(), TransportError> {
    if !frame.has_valid_id() {
        return Err(TransportError::InvalidFrame(format!(
            "identifier 0x{:X} out of range for {} frame",
            frame.id,
            if frame.extended { "extended" } else { "standard" }
        )));
    }
    if frame.payload.len() > max_payload {
        return Err(TransportError::InvalidFrame(format!(
            "payload of {} bytes exceeds limit of {}",
            frame.payload.len(),
            max_payload
        )));
    }
    Ok(())
}
