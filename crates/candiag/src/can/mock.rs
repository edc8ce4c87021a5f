//! Mock transport for testing
//!
//! Frames handed to [`MockTransport::send`] are recorded and answered from a
//! canned request/response table or by attached [`FrameResponder`]s, such as
//! the simulated ECU in [`crate::sim`]. Replies are pushed to subscribers the
//! same way a real channel would deliver received frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use super::transport::{check_frame, BusCounters};
use super::{BusStatistics, CanFilter, CanFrame, CanTransport, FilterTable, TransportError};
use crate::config::CanConfig;

/// Something on the simulated bus that reacts to frames
pub trait FrameResponder: Send + Sync {
    /// Frames to put on the bus in reply to `request` (possibly none)
    fn respond(&self, request: &CanFrame) -> Vec<CanFrame>;
}

/// In-memory transport
pub struct MockTransport {
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<CanFrame>,
    latency: Duration,
    max_payload: usize,
    /// Canned replies keyed by request payload
    responses: RwLock<Vec<(Vec<u8>, CanFrame)>>,
    responders: RwLock<Vec<Arc<dyn FrameResponder>>>,
    sent: Mutex<Vec<CanFrame>>,
    filters: FilterTable,
    counters: Arc<BusCounters>,
}

impl MockTransport {
    pub fn new(config: &CanConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            connected: AtomicBool::new(true),
            incoming_tx,
            latency: Duration::from_millis(config.latency_ms),
            max_payload: config.max_payload,
            responses: RwLock::new(Vec::new()),
            responders: RwLock::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            filters: FilterTable::new(),
            counters: Arc::new(BusCounters::default()),
        }
    }

    /// Reply with `response` whenever a sent payload equals (or starts with)
    /// `request`
    pub fn add_response(&self, request: &[u8], response: CanFrame) {
        self.responses.write().push((request.to_vec(), response));
    }

    pub fn clear_responses(&self) {
        self.responses.write().clear();
    }

    pub fn add_responder(&self, responder: Arc<dyn FrameResponder>) {
        self.responders.write().push(responder);
    }

    /// Deliver a frame to subscribers as if it had been received
    pub fn inject(&self, frame: CanFrame) {
        Self::deliver(&self.incoming_tx, &self.counters, frame);
    }

    /// Every frame accepted by `send`, oldest first
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn find_response(&self, request: &CanFrame) -> Option<CanFrame> {
        let responses = self.responses.read();
        let payload = request.payload.as_ref();

        // First try exact match
        if let Some((_, resp)) = responses.iter().find(|(req, _)| req.as_slice() == payload) {
            return Some(resp.clone());
        }

        // Then try prefix match for variable-length requests
        responses
            .iter()
            .find(|(req, _)| payload.starts_with(req))
            .map(|(_, resp)| resp.clone())
    }

    fn replies_for(&self, request: &CanFrame) -> Vec<CanFrame> {
        if let Some(resp) = self.find_response(request) {
            return vec![resp];
        }
        self.responders
            .read()
            .iter()
            .flat_map(|r| r.respond(request))
            .collect()
    }

    fn deliver(tx: &broadcast::Sender<CanFrame>, counters: &BusCounters, mut frame: CanFrame) {
        frame.timestamp = std::time::Instant::now();
        counters.record_received();
        debug!(%frame, "Mock transport: delivering frame");
        // No subscribers is not an error for a bus
        let _ = tx.send(frame);
    }
}

#[async_trait]
impl CanTransport for MockTransport {
    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            self.counters.record_error();
            return Err(TransportError::ConnectionClosed);
        }
        if let Err(e) = check_frame(frame, self.max_payload) {
            self.counters.record_error();
            return Err(e);
        }

        self.counters.record_sent();
        self.sent.lock().push(frame.clone());
        debug!(%frame, "Mock transport: sent frame");

        let replies = self.replies_for(frame);
        if replies.is_empty() {
            return Ok(());
        }

        if self.latency.is_zero() {
            for reply in replies {
                Self::deliver(&self.incoming_tx, &self.counters, reply);
            }
        } else {
            let tx = self.incoming_tx.clone();
            let counters = self.counters.clone();
            let latency = self.latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                for reply in replies {
                    Self::deliver(&tx, &counters, reply);
                }
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    fn add_filter(&self, filter: CanFilter) -> bool {
        let added = self.filters.add(filter);
        if added {
            self.counters.record_filter();
        }
        added
    }

    fn remove_filter(&self, filter: &CanFilter) -> bool {
        self.filters.remove(filter)
    }

    fn filters(&self) -> Vec<CanFilter> {
        self.filters.list()
    }

    fn statistics(&self) -> BusStatistics {
        self.counters.snapshot()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}
