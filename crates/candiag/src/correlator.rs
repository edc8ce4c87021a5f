//! Request/response correlation
//!
//! A [`Correlator`] turns "send a frame, wait for the matching reply" into a
//! single awaitable call with a bounded wait. It owns one delivery task that
//! drains the transport's broadcast channel and one pending slot:
//!
//! ```text
//!   caller                      slot                       delivery task
//!     │  arm(matcher) ─────────► AwaitingResponse
//!     │  transport.send(frame)
//!     │  await (timeout)                    ◄──────────── every received frame
//!     │                          Matched ◄── first frame the matcher accepts
//!     │  ◄───────── oneshot ─────┘
//!     │  or TimedOut after the deadline (counted, slot disarmed)
//! ```
//!
//! Only one request is outstanding per correlator: [`Correlator::begin`]
//! holds a request lock for the whole exchange, so concurrent callers queue
//! instead of pipelining.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::can::{CanFrame, CanTransport, TransportError};

/// Negative response service identifier (UDS)
const NEGATIVE_RESPONSE: u8 = 0x7F;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("No matching response within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of the pending slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CorrelationState {
    Idle,
    AwaitingResponse,
    Matched,
    TimedOut,
}

/// Decides whether a received frame answers the outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMatcher {
    response_ids: Vec<u32>,
    extended: bool,
    accepted_codes: Vec<u8>,
    /// Accept `[0x7F, sid, ..]` negative responses echoing this service
    negative_for: Option<u8>,
}

impl ResponseMatcher {
    /// UDS: `sid + 0x40` or a negative response for `sid`, from `response_id`
    pub fn uds(response_id: u32, extended: bool, service_id: u8) -> Self {
        Self {
            response_ids: vec![response_id],
            extended,
            accepted_codes: vec![service_id.wrapping_add(0x40)],
            negative_for: Some(service_id),
        }
    }

    /// OBD-II: `mode + 0x40` from `response_id` or any of `ecu_ids`
    pub fn obd(response_id: u32, ecu_ids: &[u32], extended: bool, mode: u8) -> Self {
        let mut response_ids = Vec::with_capacity(ecu_ids.len() + 1);
        response_ids.push(response_id);
        response_ids.extend(ecu_ids.iter().copied().filter(|id| *id != response_id));
        Self {
            response_ids,
            extended,
            accepted_codes: vec![mode.wrapping_add(0x40)],
            negative_for: None,
        }
    }

    pub fn matches(&self, frame: &CanFrame) -> bool {
        if frame.extended != self.extended || !self.response_ids.contains(&frame.id) {
            return false;
        }
        match frame.first_byte() {
            Some(code) if self.accepted_codes.contains(&code) => true,
            Some(NEGATIVE_RESPONSE) => match self.negative_for {
                Some(sid) => frame.payload.get(1) == Some(&sid),
                None => false,
            },
            _ => false,
        }
    }
}

/// Counters for one correlator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
}

struct Pending {
    matcher: ResponseMatcher,
    tx: oneshot::Sender<CanFrame>,
}

struct Slot {
    state: CorrelationState,
    pending: Option<Pending>,
}

/// Single-slot request/response correlator bound to one transport
pub struct Correlator {
    transport: Arc<dyn CanTransport>,
    slot: Arc<Mutex<Slot>>,
    request_lock: tokio::sync::Mutex<()>,
    stats: Mutex<CorrelatorStatistics>,
    delivery: JoinHandle<()>,
}

impl Correlator {
    /// Subscribe to `transport` and start the delivery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(transport: Arc<dyn CanTransport>) -> Self {
        let slot = Arc::new(Mutex::new(Slot {
            state: CorrelationState::Idle,
            pending: None,
        }));
        let rx = transport.subscribe();
        let delivery = tokio::spawn(Self::run_delivery(rx, slot.clone()));

        Self {
            transport,
            slot,
            request_lock: tokio::sync::Mutex::new(()),
            stats: Mutex::new(CorrelatorStatistics::default()),
            delivery,
        }
    }

    pub fn transport(&self) -> &Arc<dyn CanTransport> {
        &self.transport
    }

    pub fn state(&self) -> CorrelationState {
        self.slot.lock().state
    }

    pub fn statistics(&self) -> CorrelatorStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = CorrelatorStatistics::default();
    }

    /// Start an exclusive exchange; waits while another one is in progress
    pub async fn begin(&self) -> Exchange<'_> {
        let guard = self.request_lock.lock().await;
        Exchange {
            correlator: self,
            _guard: guard,
        }
    }

    /// Send `frame` and wait for the first frame `matcher` accepts
    pub async fn request(
        &self,
        frame: CanFrame,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<CanFrame, CorrelatorError> {
        self.begin()
            .await
            .send_and_wait(frame, matcher, timeout)
            .await
    }

    /// Send a frame that expects no reply, still serialized with requests
    pub async fn send_only(&self, frame: CanFrame) -> Result<(), CorrelatorError> {
        let _guard = self.request_lock.lock().await;
        self.transport.send(&frame).await?;
        self.stats.lock().requests_sent += 1;
        Ok(())
    }

    async fn run_delivery(mut rx: broadcast::Receiver<CanFrame>, slot: Arc<Mutex<Slot>>) {
        loop {
            match rx.recv().await {
                Ok(frame) => Self::offer(&slot, frame),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Correlator fell behind the transport, frames dropped");
                }
                Err(RecvError::Closed) => {
                    debug!("Transport closed, correlator delivery stopped");
                    break;
                }
            }
        }
    }

    /// Runs on the delivery path: only inspects, stores and signals
    fn offer(slot: &Mutex<Slot>, frame: CanFrame) {
        let mut slot = slot.lock();
        let accepted = slot
            .pending
            .as_ref()
            .is_some_and(|pending| pending.matcher.matches(&frame));
        if !accepted {
            trace!(%frame, "Ignoring unmatched frame");
            return;
        }
        if let Some(pending) = slot.pending.take() {
            slot.state = CorrelationState::Matched;
            // The waiter may have given up already
            let _ = pending.tx.send(frame);
        }
    }

    fn arm(&self, matcher: ResponseMatcher) -> Result<oneshot::Receiver<CanFrame>, CorrelatorError> {
        if self.delivery.is_finished() {
            return Err(TransportError::ReceiveFailed("delivery path closed".to_string()).into());
        }
        let (tx, rx) = oneshot::channel();
        let mut slot = self.slot.lock();
        slot.pending = Some(Pending { matcher, tx });
        slot.state = CorrelationState::AwaitingResponse;
        Ok(rx)
    }

    fn disarm(&self, state: CorrelationState) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.state = state;
    }

    async fn await_armed(
        &self,
        rx: oneshot::Receiver<CanFrame>,
        timeout: Duration,
    ) -> Result<CanFrame, CorrelatorError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => {
                self.stats.lock().responses_received += 1;
                debug!(%frame, "Matched response");
                Ok(frame)
            }
            Ok(Err(_)) => {
                self.disarm(CorrelationState::Idle);
                Err(TransportError::ReceiveFailed("pending response dropped".to_string()).into())
            }
            Err(_) => {
                self.disarm(CorrelationState::TimedOut);
                self.stats.lock().timeouts += 1;
                warn!(?timeout, "No matching response before deadline");
                Err(CorrelatorError::Timeout(timeout))
            }
        }
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}

/// An exclusive request/response exchange on a [`Correlator`]
///
/// Holding an exchange keeps other requests on the same correlator waiting,
/// which lets a client keep listening after an interim reply (such as a UDS
/// response-pending) without another request slipping in.
pub struct Exchange<'a> {
    correlator: &'a Correlator,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl Exchange<'_> {
    /// Arm the slot, send `frame` and wait for the first accepted reply
    pub async fn send_and_wait(
        &mut self,
        frame: CanFrame,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<CanFrame, CorrelatorError> {
        let correlator = self.correlator;
        // Armed before sending so a fast reply cannot slip past
        let rx = correlator.arm(matcher)?;
        if let Err(e) = correlator.transport.send(&frame).await {
            correlator.disarm(CorrelationState::Idle);
            return Err(e.into());
        }
        correlator.stats.lock().requests_sent += 1;
        correlator.await_armed(rx, timeout).await
    }

    /// Keep waiting for another reply without sending anything
    pub async fn wait(
        &mut self,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<CanFrame, CorrelatorError> {
        let rx = self.correlator.arm(matcher)?;
        self.correlator.await_armed(rx, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{MockCanTransport, MockTransport};
    use crate::config::CanConfig;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MockTransport>, Correlator) {
        let transport = Arc::new(MockTransport::new(&CanConfig::default()));
        let correlator = Correlator::new(transport.clone());
        (transport, correlator)
    }

    #[test]
    fn test_uds_matcher() {
        let matcher = ResponseMatcher::uds(0x7E8, false, 0x22);
        assert!(matcher.matches(&CanFrame::new(0x7E8, &[0x62, 0xF1, 0x90])));
        assert!(matcher.matches(&CanFrame::new(0x7E8, &[0x7F, 0x22, 0x31])));
        // Negative response for another service
        assert!(!matcher.matches(&CanFrame::new(0x7E8, &[0x7F, 0x10, 0x31])));
        // Wrong id, wrong id type, wrong code, empty payload
        assert!(!matcher.matches(&CanFrame::new(0x7E9, &[0x62])));
        assert!(!matcher.matches(&CanFrame::new_extended(0x7E8, &[0x62])));
        assert!(!matcher.matches(&CanFrame::new(0x7E8, &[0x50, 0x01])));
        assert!(!matcher.matches(&CanFrame::new(0x7E8, &[])));
    }

    #[test]
    fn test_obd_matcher_accepts_any_ecu() {
        let matcher = ResponseMatcher::obd(0x7E8, &[0x7E8, 0x7E9, 0x7EA], false, 0x01);
        assert!(matcher.matches(&CanFrame::new(0x7E8, &[0x41, 0x0C])));
        assert!(matcher.matches(&CanFrame::new(0x7EA, &[0x41, 0x0C])));
        assert!(!matcher.matches(&CanFrame::new(0x7EB, &[0x41, 0x0C])));
        assert!(!matcher.matches(&CanFrame::new(0x7E8, &[0x7F, 0x01, 0x12])));
    }

    #[tokio::test]
    async fn test_request_matches_response() {
        let (transport, correlator) = setup();
        transport.add_response(&[0x3E, 0x00], CanFrame::new(0x7E8, &[0x7E, 0x00]));

        assert_eq!(correlator.state(), CorrelationState::Idle);
        let response = correlator
            .request(
                CanFrame::new(0x7E0, &[0x3E, 0x00]),
                ResponseMatcher::uds(0x7E8, false, 0x3E),
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        assert_eq!(response.payload[..], [0x7E, 0x00]);
        assert_eq!(correlator.state(), CorrelationState::Matched);
        assert_eq!(
            correlator.statistics(),
            CorrelatorStatistics {
                requests_sent: 1,
                responses_received: 1,
                timeouts: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_once_and_recovers() {
        let (transport, correlator) = setup();
        let matcher = ResponseMatcher::uds(0x7E8, false, 0x3E);

        let err = correlator
            .request(
                CanFrame::new(0x7E0, &[0x3E, 0x00]),
                matcher.clone(),
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelatorError::Timeout(_)));
        assert_eq!(correlator.state(), CorrelationState::TimedOut);
        assert_eq!(correlator.statistics().timeouts, 1);

        // Usable immediately afterwards
        transport.add_response(&[0x3E, 0x00], CanFrame::new(0x7E8, &[0x7E, 0x00]));
        correlator
            .request(
                CanFrame::new(0x7E0, &[0x3E, 0x00]),
                matcher,
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert_eq!(correlator.statistics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_only_first_matching_frame_is_consumed() {
        let (transport, correlator) = setup();
        let matcher = ResponseMatcher::uds(0x7E8, false, 0x22);

        let mut exchange = correlator.begin().await;
        let rx = correlator.arm(matcher.clone()).unwrap();
        transport.inject(CanFrame::new(0x7E9, &[0x62, 0x00])); // wrong id
        transport.inject(CanFrame::new(0x7E8, &[0x62, 0x01]));
        transport.inject(CanFrame::new(0x7E8, &[0x62, 0x02]));

        let frame = correlator
            .await_armed(rx, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(frame.payload[..], [0x62, 0x01]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The late duplicate is not waiting in the slot for the next request
        let err = exchange
            .wait(matcher, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, CorrelatorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_failure_is_transport_error() {
        let mut mock = MockCanTransport::new();
        let (tx, _) = broadcast::channel(4);
        mock.expect_subscribe().returning(move || tx.subscribe());
        mock.expect_send()
            .returning(|_| Err(TransportError::SendFailed("bus off".to_string())));

        let correlator = Correlator::new(Arc::new(mock));
        let err = correlator
            .request(
                CanFrame::new(0x7E0, &[0x10, 0x01]),
                ResponseMatcher::uds(0x7E8, false, 0x10),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CorrelatorError::Transport(TransportError::SendFailed("bus off".to_string()))
        );
        assert_eq!(correlator.state(), CorrelationState::Idle);
        assert_eq!(correlator.statistics().timeouts, 0);
    }

    #[tokio::test]
    async fn test_requests_are_serialized() {
        let (transport, correlator) = setup();
        transport.add_response(&[0x3E, 0x00], CanFrame::new(0x7E8, &[0x7E, 0x00]));
        let correlator = Arc::new(correlator);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let correlator = correlator.clone();
            handles.push(tokio::spawn(async move {
                correlator
                    .request(
                        CanFrame::new(0x7E0, &[0x3E, 0x00]),
                        ResponseMatcher::uds(0x7E8, false, 0x3E),
                        Duration::from_millis(500),
                    )
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(correlator.statistics().responses_received, 4);
    }
}
