//! UDS client state machine
//!
//! Every service method returns a tri-state:
//! - `Ok(value)` on a positive response
//! - `Ok(false)` / `Ok(empty)` on a negative response, with the NRC kept in
//!   [`UdsClient::last_error`]
//! - `Err(UdsError)` when the transport fails, nothing answers in time or
//!   the reply is malformed

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::dtc::{
    encode_record_request, parse_dtc_records, parse_record_response, status_bit, sub_function,
    DtcInfo, DtcRecordKind,
};
use super::error::{ErrorInfo, UdsError};
use super::{
    service_id, service_name, NegativeResponseCode, ResetType, RoutineControlType, SessionType,
};
use crate::can::{can_id_to_string, CanFrame, CanTransport};
use crate::config::UdsConfig;
use crate::correlator::{CorrelatorError, Correlator, ResponseMatcher};
use crate::message::DiagnosticMessage;
use crate::pool::WorkerPool;

/// Data format identifier for RequestDownload / RequestUpload (no compression)
const DATA_FORMAT_RAW: u8 = 0x00;
/// 4-byte memory size, 4-byte memory address
const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;
/// Suppress-positive-response bit of a sub-function
const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Request counters for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdsStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub negative_responses: u64,
    pub timeouts: u64,
    pub start_time: DateTime<Utc>,
}

impl Default for UdsStatistics {
    fn default() -> Self {
        Self {
            requests_sent: 0,
            responses_received: 0,
            negative_responses: 0,
            timeouts: 0,
            start_time: Utc::now(),
        }
    }
}

/// UDS client bound to one request/response id pair
pub struct UdsClient {
    config: UdsConfig,
    correlator: Correlator,
    session: Mutex<SessionType>,
    last_error: Mutex<Option<ErrorInfo>>,
    stats: Mutex<UdsStatistics>,
}

impl UdsClient {
    /// Must be called within a tokio runtime
    pub fn new(config: UdsConfig, transport: Arc<dyn CanTransport>) -> Self {
        info!(
            request_id = %can_id_to_string(config.request_id, config.extended_ids),
            response_id = %can_id_to_string(config.response_id, config.extended_ids),
            "UDS client initialized"
        );
        Self {
            config,
            correlator: Correlator::new(transport),
            session: Mutex::new(SessionType::Default),
            last_error: Mutex::new(None),
            stats: Mutex::new(UdsStatistics::default()),
        }
    }

    pub fn config(&self) -> &UdsConfig {
        &self.config
    }

    pub fn current_session(&self) -> SessionType {
        *self.session.lock()
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn statistics(&self) -> UdsStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = UdsStatistics::default();
        self.correlator.reset_statistics();
    }

    fn frame(&self, payload: &[u8]) -> CanFrame {
        CanFrame::with_id_type(self.config.request_id, self.config.extended_ids, payload)
    }

    fn set_error(&self, code: NegativeResponseCode, description: impl Into<String>) {
        *self.last_error.lock() = Some(ErrorInfo::new(code, description));
    }

    /// Send a request and wait for its final response
    ///
    /// A response-pending NRC (0x78) keeps the exchange open and waits up to
    /// P2* for the real answer.
    pub async fn send_request(
        &self,
        request: &DiagnosticMessage,
    ) -> Result<DiagnosticMessage, UdsError> {
        let sid = request.service;
        let matcher = ResponseMatcher::uds(self.config.response_id, self.config.extended_ids, sid);
        debug!(service = service_name(sid), %request, "Sending UDS request");

        let mut exchange = self.correlator.begin().await;
        let mut result = exchange
            .send_and_wait(
                self.frame(&request.to_payload()),
                matcher.clone(),
                self.config.timeout(),
            )
            .await;

        if !matches!(result, Err(CorrelatorError::Transport(_))) {
            self.stats.lock().requests_sent += 1;
        }

        loop {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => return Err(self.record_failure(sid, e)),
            };
            let response = match DiagnosticMessage::from_response(&frame.payload) {
                Ok(response) => response,
                Err(e) => {
                    self.set_error(NegativeResponseCode::GeneralReject, e.to_string());
                    return Err(e.into());
                }
            };

            if response.nrc() == Some(NegativeResponseCode::ResponsePending) {
                debug!(service = service_name(sid), "Response pending, waiting P2*");
                result = exchange.wait(matcher.clone(), self.config.p2_star()).await;
                continue;
            }

            self.record_response(&response);
            return Ok(response);
        }
    }

    fn record_failure(&self, sid: u8, err: CorrelatorError) -> UdsError {
        match &err {
            CorrelatorError::Timeout(after) => {
                self.stats.lock().timeouts += 1;
                warn!(service = service_name(sid), ?after, "UDS request timeout");
                self.set_error(NegativeResponseCode::GeneralReject, "Request timeout");
            }
            CorrelatorError::Transport(e) => {
                warn!(service = service_name(sid), error = %e, "Failed to send UDS request");
                self.set_error(
                    NegativeResponseCode::GeneralReject,
                    "Failed to send CAN message",
                );
            }
        }
        err.into()
    }

    fn record_response(&self, response: &DiagnosticMessage) {
        let mut stats = self.stats.lock();
        stats.responses_received += 1;
        match response.nrc() {
            Some(nrc) => {
                stats.negative_responses += 1;
                drop(stats);
                warn!(
                    service = service_name(response.service),
                    nrc = %nrc,
                    "Negative response"
                );
                self.set_error(nrc, nrc.description());
            }
            None => {
                drop(stats);
                debug!(%response, "Received UDS response");
                self.clear_error();
            }
        }
    }

    /// Run [`send_request`](Self::send_request) on `pool` and hand the result
    /// to `callback`
    pub fn send_request_async<F>(
        self: &Arc<Self>,
        pool: &WorkerPool,
        request: DiagnosticMessage,
        callback: F,
    ) -> Result<(), UdsError>
    where
        F: FnOnce(Result<DiagnosticMessage, UdsError>) + Send + 'static,
    {
        let client = Arc::clone(self);
        pool.submit(async move {
            let result = client.send_request(&request).await;
            callback(result);
        })?;
        Ok(())
    }

    /// Positive response data, `None` after a negative response
    async fn positive(&self, sid: u8, data: Vec<u8>) -> Result<Option<Vec<u8>>, UdsError> {
        let response = self
            .send_request(&DiagnosticMessage::request(sid, data))
            .await?;
        Ok(response.is_positive().then_some(response.data))
    }

    // =========================================================================
    // Session / Reset
    // =========================================================================

    /// Diagnostic Session Control (0x10)
    pub async fn start_session(&self, session: SessionType) -> Result<bool, UdsError> {
        let response = self
            .positive(service_id::DIAGNOSTIC_SESSION_CONTROL, vec![session.as_byte()])
            .await?;
        if response.is_none() {
            return Ok(false);
        }
        *self.session.lock() = session;
        info!(%session, "Diagnostic session changed");
        Ok(true)
    }

    /// ECU Reset (0x11). The tracked session is left as is.
    pub async fn reset_ecu(&self, reset_type: ResetType) -> Result<bool, UdsError> {
        let response = self
            .positive(service_id::ECU_RESET, vec![reset_type.as_byte()])
            .await?;
        if response.is_some() {
            info!(?reset_type, "ECU reset accepted");
        }
        Ok(response.is_some())
    }

    // =========================================================================
    // Security Access (0x27)
    // =========================================================================

    /// Seed for `level`; empty after a negative response or a reply without
    /// seed bytes
    pub async fn request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        let data = self
            .positive(service_id::SECURITY_ACCESS, vec![level])
            .await?;
        Ok(match data {
            Some(data) if data.len() > 1 => data[1..].to_vec(),
            _ => Vec::new(),
        })
    }

    /// Send `key` with sub-function `level + 1`
    pub async fn send_key(&self, level: u8, key: &[u8]) -> Result<bool, UdsError> {
        let mut data = Vec::with_capacity(key.len() + 1);
        data.push(level.wrapping_add(1));
        data.extend_from_slice(key);
        let accepted = self
            .positive(service_id::SECURITY_ACCESS, data)
            .await?
            .is_some();
        if accepted {
            info!(level, "Security access granted");
        }
        Ok(accepted)
    }

    /// Request a seed, then send a precomputed key
    pub async fn unlock_security_access(&self, level: u8, key: &[u8]) -> Result<bool, UdsError> {
        self.unlock_security_access_with(level, |_| key.to_vec())
            .await
    }

    /// Request a seed and answer with `compute_key(seed)`
    ///
    /// An all-zero seed means the level is already unlocked; no key is sent.
    pub async fn unlock_security_access_with<F>(
        &self,
        level: u8,
        compute_key: F,
    ) -> Result<bool, UdsError>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let seed = self.request_seed(level).await?;
        if seed.is_empty() {
            warn!(level, "No seed received, security access not attempted");
            return Ok(false);
        }
        if seed.iter().all(|b| *b == 0) {
            debug!(level, "Zero seed, security level already unlocked");
            return Ok(true);
        }
        let key = compute_key(&seed);
        self.send_key(level, &key).await
    }

    // =========================================================================
    // Tester Present (0x3E)
    // =========================================================================

    /// With `suppress_response` the request is only sent; nothing is awaited
    pub async fn tester_present(&self, suppress_response: bool) -> Result<bool, UdsError> {
        if suppress_response {
            let payload = [service_id::TESTER_PRESENT, SUPPRESS_POSITIVE_RESPONSE];
            self.correlator.send_only(self.frame(&payload)).await?;
            self.stats.lock().requests_sent += 1;
            return Ok(true);
        }
        Ok(self
            .positive(service_id::TESTER_PRESENT, vec![0x00])
            .await?
            .is_some())
    }

    // =========================================================================
    // Data Identifiers (0x22, 0x2E)
    // =========================================================================

    /// Read Data By Identifier (0x22), without the echoed DID
    pub async fn read_data_by_identifier(&self, did: u16) -> Result<Vec<u8>, UdsError> {
        let data = self
            .positive(service_id::READ_DATA_BY_ID, did.to_be_bytes().to_vec())
            .await?;
        Ok(match data {
            Some(data) if data.len() > 2 => data[2..].to_vec(),
            _ => Vec::new(),
        })
    }

    /// One 0x22 request per identifier; identifiers without data are left out
    pub async fn read_multiple_data_by_identifier(
        &self,
        dids: &[u16],
    ) -> Result<BTreeMap<u16, Vec<u8>>, UdsError> {
        let mut results = BTreeMap::new();
        for &did in dids {
            let data = self.read_data_by_identifier(did).await?;
            if !data.is_empty() {
                results.insert(did, data);
            }
        }
        Ok(results)
    }

    /// Write Data By Identifier (0x2E)
    pub async fn write_data_by_identifier(&self, did: u16, value: &[u8]) -> Result<bool, UdsError> {
        let mut data = did.to_be_bytes().to_vec();
        data.extend_from_slice(value);
        Ok(self
            .positive(service_id::WRITE_DATA_BY_ID, data)
            .await?
            .is_some())
    }

    // =========================================================================
    // DTC Services (0x14, 0x19)
    // =========================================================================

    /// Clear Diagnostic Information (0x14) for a 3-byte DTC group
    pub async fn clear_diagnostic_information(&self, group: u32) -> Result<bool, UdsError> {
        let bytes = group.to_be_bytes();
        Ok(self
            .positive(service_id::CLEAR_DIAGNOSTIC_INFO, bytes[1..].to_vec())
            .await?
            .is_some())
    }

    /// Read DTC Information (0x19)
    pub async fn read_dtc_information(
        &self,
        sub_function: u8,
        status_mask: u8,
    ) -> Result<Vec<DtcInfo>, UdsError> {
        let data = self
            .positive(service_id::READ_DTC_INFO, vec![sub_function, status_mask])
            .await?;
        Ok(data.map(|data| parse_dtc_records(&data)).unwrap_or_default())
    }

    pub async fn read_stored_dtcs(&self) -> Result<Vec<DtcInfo>, UdsError> {
        self.read_dtc_information(
            sub_function::REPORT_DTC_BY_STATUS_MASK,
            status_bit::CONFIRMED_DTC,
        )
        .await
    }

    pub async fn read_pending_dtcs(&self) -> Result<Vec<DtcInfo>, UdsError> {
        self.read_dtc_information(
            sub_function::REPORT_DTC_BY_STATUS_MASK,
            status_bit::PENDING_DTC,
        )
        .await
    }

    pub async fn read_confirmed_dtcs(&self) -> Result<Vec<DtcInfo>, UdsError> {
        self.read_dtc_information(
            sub_function::REPORT_DTC_BY_STATUS_MASK,
            status_bit::CONFIRMED_DTC,
        )
        .await
    }

    /// Snapshot (0x19 0x04) or extended data (0x19 0x06) record of one DTC
    ///
    /// `None` after a negative response. The record bytes land in
    /// `snapshot_data` or `extended_data` of the returned record.
    pub async fn read_dtc_record(
        &self,
        kind: DtcRecordKind,
        dtc_number: u32,
        record: u8,
    ) -> Result<Option<DtcInfo>, UdsError> {
        let request = encode_record_request(kind, dtc_number, record);
        let Some(data) = self.positive(service_id::READ_DTC_INFO, request).await? else {
            return Ok(None);
        };
        parse_record_response(kind, &data).map(Some).ok_or_else(|| {
            UdsError::InvalidResponse(format!(
                "malformed DTC record response for 0x{:06X}",
                dtc_number
            ))
        })
    }

    pub async fn read_dtc_snapshot(
        &self,
        dtc_number: u32,
        record: u8,
    ) -> Result<Option<DtcInfo>, UdsError> {
        self.read_dtc_record(DtcRecordKind::Snapshot, dtc_number, record)
            .await
    }

    pub async fn read_dtc_extended_data(
        &self,
        dtc_number: u32,
        record: u8,
    ) -> Result<Option<DtcInfo>, UdsError> {
        self.read_dtc_record(DtcRecordKind::ExtendedData, dtc_number, record)
            .await
    }

    // =========================================================================
    // Routine Control (0x31) / IO Control (0x2F)
    // =========================================================================

    /// Routine status record (after the control type and routine id echo)
    pub async fn routine_control(
        &self,
        control: RoutineControlType,
        routine_id: u16,
        params: &[u8],
    ) -> Result<Vec<u8>, UdsError> {
        let mut data = vec![control.as_byte()];
        data.extend_from_slice(&routine_id.to_be_bytes());
        data.extend_from_slice(params);
        let response = self.positive(service_id::ROUTINE_CONTROL, data).await?;
        Ok(match response {
            Some(data) if data.len() > 3 => data[3..].to_vec(),
            _ => Vec::new(),
        })
    }

    /// Whether a routine request was accepted, ignoring its status record
    pub async fn routine_accepted(
        &self,
        control: RoutineControlType,
        routine_id: u16,
        params: &[u8],
    ) -> Result<bool, UdsError> {
        let mut data = vec![control.as_byte()];
        data.extend_from_slice(&routine_id.to_be_bytes());
        data.extend_from_slice(params);
        Ok(self
            .positive(service_id::ROUTINE_CONTROL, data)
            .await?
            .is_some())
    }

    pub async fn input_output_control(
        &self,
        did: u16,
        control_parameter: u8,
        control_state: &[u8],
    ) -> Result<bool, UdsError> {
        let mut data = did.to_be_bytes().to_vec();
        data.push(control_parameter);
        data.extend_from_slice(control_state);
        Ok(self
            .positive(service_id::IO_CONTROL_BY_ID, data)
            .await?
            .is_some())
    }

    // =========================================================================
    // Transfer Services (0x34, 0x35, 0x36, 0x37)
    // =========================================================================

    /// Request Download (0x34)
    ///
    /// Returns the ECU's maxNumberOfBlockLength (0 when it sent none), or
    /// `None` when the download was refused.
    pub async fn request_download(&self, address: u32, size: u32) -> Result<Option<u32>, UdsError> {
        let data = self
            .positive(service_id::REQUEST_DOWNLOAD, memory_request(address, size))
            .await?;
        data.map(|d| parse_max_block_length(&d)).transpose()
    }

    /// Request Upload (0x35), same layout and result as a download
    pub async fn request_upload(&self, address: u32, size: u32) -> Result<Option<u32>, UdsError> {
        let data = self
            .positive(service_id::REQUEST_UPLOAD, memory_request(address, size))
            .await?;
        data.map(|d| parse_max_block_length(&d)).transpose()
    }

    /// Transfer Data (0x36) download block
    pub async fn transfer_data(&self, sequence: u8, chunk: &[u8]) -> Result<bool, UdsError> {
        let mut data = Vec::with_capacity(chunk.len() + 1);
        data.push(sequence);
        data.extend_from_slice(chunk);
        match self.positive(service_id::TRANSFER_DATA, data).await? {
            Some(echo) => {
                check_sequence_echo(sequence, &echo)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transfer Data (0x36) upload block: the bytes the ECU returned
    pub async fn transfer_data_upload(&self, sequence: u8) -> Result<Option<Vec<u8>>, UdsError> {
        match self
            .positive(service_id::TRANSFER_DATA, vec![sequence])
            .await?
        {
            Some(data) => {
                check_sequence_echo(sequence, &data)?;
                Ok(Some(data[1..].to_vec()))
            }
            None => Ok(None),
        }
    }

    /// Request Transfer Exit (0x37)
    pub async fn request_transfer_exit(&self) -> Result<bool, UdsError> {
        Ok(self
            .positive(service_id::REQUEST_TRANSFER_EXIT, Vec::new())
            .await?
            .is_some())
    }
}

/// `[dataFormat, addressAndLengthFormat, address(4), size(4)]`
fn memory_request(address: u32, size: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(10);
    data.push(DATA_FORMAT_RAW);
    data.push(ADDRESS_AND_LENGTH_FORMAT);
    data.extend_from_slice(&address.to_be_bytes());
    data.extend_from_slice(&size.to_be_bytes());
    data
}

/// `[lengthFormatIdentifier, maxNumberOfBlockLength..]`
fn parse_max_block_length(data: &[u8]) -> Result<u32, UdsError> {
    let Some(&length_format) = data.first() else {
        return Ok(0);
    };
    let num_bytes = (length_format >> 4) as usize;
    if num_bytes > 4 {
        return Err(UdsError::InvalidResponse(format!(
            "maxNumberOfBlockLength of {} bytes",
            num_bytes
        )));
    }
    let bytes = data.get(1..1 + num_bytes).ok_or_else(|| {
        UdsError::InvalidResponse("Response missing maxNumberOfBlockLength".to_string())
    })?;
    Ok(bytes
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

fn check_sequence_echo(sequence: u8, data: &[u8]) -> Result<(), UdsError> {
    match data.first() {
        Some(&echo) if echo == sequence => Ok(()),
        Some(&echo) => Err(UdsError::InvalidResponse(format!(
            "TransferData echoed block 0x{:02X}, expected 0x{:02X}",
            echo, sequence
        ))),
        None => Err(UdsError::InvalidResponse(
            "TransferData response too short".to_string(),
        )),
    }
}

/// Key derivation used by the simulated ECU and the demo: `seed ^ secret`,
/// repeating `secret` as needed
pub fn xor_key(seed: &[u8], secret: &[u8]) -> Vec<u8> {
    if secret.is_empty() {
        return seed.to_vec();
    }
    seed.iter()
        .zip(secret.iter().cycle())
        .map(|(s, k)| s ^ k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockTransport;
    use crate::config::CanConfig;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn setup() -> (Arc<MockTransport>, UdsClient) {
        let transport = Arc::new(MockTransport::new(&CanConfig::default()));
        let config = UdsConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let client = UdsClient::new(config, transport.clone());
        (transport, client)
    }

    fn reply(payload: &[u8]) -> CanFrame {
        CanFrame::new(0x7E8, payload)
    }

    #[tokio::test]
    async fn test_session_changes_only_on_positive_response() {
        let (transport, client) = setup();
        transport.add_response(&[0x10, 0x03], reply(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]));
        transport.add_response(&[0x10, 0x02], reply(&[0x7F, 0x10, 0x22]));

        assert_eq!(client.current_session(), SessionType::Default);
        assert!(client.start_session(SessionType::ExtendedDiagnostic).await.unwrap());
        assert_eq!(client.current_session(), SessionType::ExtendedDiagnostic);

        assert!(!client.start_session(SessionType::Programming).await.unwrap());
        assert_eq!(client.current_session(), SessionType::ExtendedDiagnostic);
        let error = client.last_error().unwrap();
        assert_eq!(error.code, NegativeResponseCode::ConditionsNotCorrect);
        assert_eq!(error.description, "Conditions not correct");
    }

    #[tokio::test]
    async fn test_denied_seed_skips_key() {
        let (transport, client) = setup();
        transport.add_response(&[0x27, 0x01], reply(&[0x7F, 0x27, 0x33]));

        let unlocked = client.unlock_security_access(0x01, &[0xAA, 0xBB]).await.unwrap();
        assert!(!unlocked);

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload[..], [0x27, 0x01]);
        assert_eq!(
            client.last_error().unwrap().code,
            NegativeResponseCode::SecurityAccessDenied
        );
    }

    #[tokio::test]
    async fn test_unlock_with_computed_key() {
        let (transport, client) = setup();
        transport.add_response(&[0x27, 0x03], reply(&[0x67, 0x03, 0x12, 0x34]));
        transport.add_response(&[0x27, 0x04, 0x12 ^ 0xFF, 0x34 ^ 0xFF], reply(&[0x67, 0x04]));

        let unlocked = client
            .unlock_security_access_with(0x03, |seed| xor_key(seed, &[0xFF]))
            .await
            .unwrap();
        assert!(unlocked);
        assert_eq!(transport.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_seed_means_unlocked() {
        let (transport, client) = setup();
        transport.add_response(&[0x27, 0x01], reply(&[0x67, 0x01, 0x00, 0x00]));

        assert!(client.unlock_security_access(0x01, &[0x01]).await.unwrap());
        assert_eq!(transport.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_once_and_client_recovers() {
        let (transport, client) = setup();

        let err = client.read_data_by_identifier(0xF190).await.unwrap_err();
        assert!(matches!(err, UdsError::Timeout(_)));
        assert_eq!(client.statistics().timeouts, 1);
        assert_eq!(client.last_error().unwrap().description, "Request timeout");

        transport.add_response(&[0x22, 0xF1, 0x90], reply(&[0x62, 0xF1, 0x90, b'W', b'0']));
        let data = client.read_data_by_identifier(0xF190).await.unwrap();
        assert_eq!(data, b"W0".to_vec());
        assert_eq!(client.statistics().timeouts, 1);
        assert_eq!(client.last_error(), None);
    }

    #[tokio::test]
    async fn test_response_pending_waits_for_final_answer() {
        let (transport, client) = setup();
        transport.add_response(&[0x31, 0x01, 0xFF, 0x00], reply(&[0x7F, 0x31, 0x78]));

        let pending = tokio::spawn({
            let transport = transport.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                transport.inject(reply(&[0x71, 0x01, 0xFF, 0x00, 0x00]));
            }
        });

        // The final answer arrives after the normal timeout but within P2*
        let status = client
            .routine_control(RoutineControlType::Start, 0xFF00, &[])
            .await
            .unwrap();
        assert_eq!(status, vec![0x00]);
        pending.await.unwrap();

        let stats = client.statistics();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.negative_responses, 0);
    }

    #[tokio::test]
    async fn test_read_dtc_information() {
        let (transport, client) = setup();
        transport.add_response(
            &[0x19, 0x02, 0x08],
            reply(&[0x59, 0x02, 0xFF, 0x00, 0xAB, 0x00, 0x08, 0xC0, 0x64, 0x00, 0x09]),
        );

        let dtcs = client.read_stored_dtcs().await.unwrap();
        let codes: Vec<_> = dtcs.iter().map(DtcInfo::code).collect();
        assert_eq!(codes, vec!["P0171", "U0100"]);
        assert!(dtcs[1].status.is_active());
    }

    #[tokio::test]
    async fn test_read_dtc_snapshot_and_extended_data() {
        let (transport, client) = setup();
        transport.add_response(
            &[0x19, 0x04, 0x00, 0xAB, 0x00, 0x01],
            reply(&[0x59, 0x04, 0x00, 0xAB, 0x00, 0x09, 0x01, 0x01, 0xF4, 0x0D, 0x32]),
        );
        transport.add_response(
            &[0x19, 0x06, 0x00, 0xAB, 0x00, 0xFF],
            reply(&[0x59, 0x06, 0x00, 0xAB, 0x00, 0x09, 0x01, 0x03]),
        );

        let snapshot = client.read_dtc_snapshot(0x00AB00, 0x01).await.unwrap().unwrap();
        assert_eq!(snapshot.code(), "P0171");
        assert_eq!(snapshot.snapshot_data, vec![0x01, 0x01, 0xF4, 0x0D, 0x32]);

        let extended = client
            .read_dtc_extended_data(0x00AB00, 0xFF)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(extended.extended_data, vec![0x01, 0x03]);
        assert!(extended.snapshot_data.is_empty());
    }

    #[tokio::test]
    async fn test_read_dtc_record_unknown_dtc() {
        let (transport, client) = setup();
        transport.add_response(&[0x19, 0x04], reply(&[0x7F, 0x19, 0x31]));

        assert_eq!(client.read_dtc_snapshot(0x123400, 0x01).await.unwrap(), None);
        assert_eq!(
            client.last_error().map(|e| e.code),
            Some(NegativeResponseCode::RequestOutOfRange)
        );
    }

    #[tokio::test]
    async fn test_clear_sends_three_byte_group() {
        let (transport, client) = setup();
        transport.add_response(&[0x14], reply(&[0x54]));

        assert!(client.clear_diagnostic_information(0xFFFFFF).await.unwrap());
        assert_eq!(transport.sent_frames()[0].payload[..], [0x14, 0xFF, 0xFF, 0xFF]);
    }

    #[tokio::test]
    async fn test_tester_present_suppressed_does_not_wait() {
        let (transport, client) = setup();

        assert!(client.tester_present(true).await.unwrap());
        assert_eq!(transport.sent_frames()[0].payload[..], [0x3E, 0x80]);
        assert_eq!(client.statistics().timeouts, 0);
    }

    #[tokio::test]
    async fn test_request_download_layout() {
        let (transport, client) = setup();
        transport.add_response(&[0x34], reply(&[0x74, 0x20, 0x01, 0x02]));

        let max = client.request_download(0x0000_8000, 0x100).await.unwrap();
        assert_eq!(max, Some(0x0102));
        assert_eq!(
            transport.sent_frames()[0].payload[..],
            [0x34, 0x00, 0x44, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[tokio::test]
    async fn test_transfer_data_checks_echo() {
        let (transport, client) = setup();
        transport.add_response(&[0x36, 0x01], reply(&[0x76, 0x01]));
        transport.add_response(&[0x36, 0x02], reply(&[0x76, 0x05]));

        assert!(client.transfer_data(0x01, &[0xAA; 4]).await.unwrap());
        let err = client.transfer_data(0x02, &[0xBB; 4]).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_truncated_negative_response_is_error() {
        let (transport, client) = setup();
        transport.add_response(&[0x11, 0x01], reply(&[0x7F, 0x11]));

        let err = client.reset_ecu(ResetType::Hard).await.unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_send_request_async_invokes_callback() {
        let (transport, client) = setup();
        transport.add_response(&[0x3E, 0x00], reply(&[0x7E, 0x00]));
        let client = Arc::new(client);
        let pool = WorkerPool::new(&Default::default());

        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .send_request_async(
                &pool,
                DiagnosticMessage::request(0x3E, vec![0x00]),
                move |result| {
                    let _ = tx.send(result);
                },
            )
            .unwrap();

        let response = rx.await.unwrap().unwrap();
        assert!(response.is_positive());
        assert_eq!(response.service, 0x3E);
        pool.shutdown().await;
    }

    #[test]
    fn test_parse_max_block_length() {
        assert_eq!(parse_max_block_length(&[]).unwrap(), 0);
        assert_eq!(parse_max_block_length(&[0x20, 0x04, 0x02]).unwrap(), 0x0402);
        assert!(parse_max_block_length(&[0x20, 0x04]).is_err());
        assert!(parse_max_block_length(&[0x50, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_xor_key() {
        assert_eq!(xor_key(&[0x12, 0x34, 0x56], &[0xFF, 0x00]), vec![0xED, 0x34, 0xA9]);
        assert_eq!(xor_key(&[0x12], &[]), vec![0x12]);
    }
}
