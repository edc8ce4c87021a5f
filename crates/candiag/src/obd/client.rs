//! OBD-II client
//!
//! One request is in flight at a time through the [`Correlator`]. Any ECU in
//! `ecu_ids` may answer; a positive reply must echo `mode + 0x40` and, for
//! modes 01/02, the PID. Unanswered requests are timeouts, since OBD-II has
//! no negative response. Supported PIDs are discovered lazily and cached,
//! and a background task can poll a PID set for live monitoring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::ObdError;
use super::pid::{parse_supported_pids, pid, pid_to_string, Parameter};
use super::{info_type, ObdMode};
use crate::can::{can_id_to_string, CanFrame, CanTransport};
use crate::config::ObdConfig;
use crate::correlator::{Correlator, CorrelatorError, ResponseMatcher};
use crate::dtc::Dtc;

/// Highest support-bitmap PID the discovery chain will follow
const LAST_SUPPORT_BITMAP: u8 = 0xC0;
const VIN_LENGTH: usize = 17;

/// Receives each non-empty batch read by the monitoring task
pub type MonitorCallback = Arc<dyn Fn(Vec<Parameter>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObdStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub errors: u64,
    pub start_time: DateTime<Utc>,
}

impl Default for ObdStatistics {
    fn default() -> Self {
        Self {
            requests_sent: 0,
            responses_received: 0,
            timeouts: 0,
            errors: 0,
            start_time: Utc::now(),
        }
    }
}

struct Monitor {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// OBD-II client on the functional request id
pub struct ObdClient {
    config: ObdConfig,
    correlator: Correlator,
    supported_pids: Mutex<Option<Vec<u8>>>,
    stats: Mutex<ObdStatistics>,
    monitor: Mutex<Option<Monitor>>,
}

impl ObdClient {
    /// Must be called within a tokio runtime
    pub fn new(config: ObdConfig, transport: Arc<dyn CanTransport>) -> Self {
        info!(
            request_id = %can_id_to_string(config.request_id, config.extended_ids),
            ecus = config.ecu_ids.len(),
            "OBD-II client initialized"
        );
        Self {
            config,
            correlator: Correlator::new(transport),
            supported_pids: Mutex::new(None),
            stats: Mutex::new(ObdStatistics::default()),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ObdConfig {
        &self.config
    }

    pub fn statistics(&self) -> ObdStatistics {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = ObdStatistics::default();
        self.correlator.reset_statistics();
    }

    /// Send `payload` and return the first positive response for its mode
    async fn query(&self, payload: &[u8]) -> Result<Vec<u8>, ObdError> {
        let mode = payload.first().copied().unwrap_or_default();
        let matcher = ResponseMatcher::obd(
            self.config.response_id,
            &self.config.ecu_ids,
            self.config.extended_ids,
            mode,
        );
        let frame =
            CanFrame::with_id_type(self.config.request_id, self.config.extended_ids, payload);
        debug!(request = %hex::encode(payload), "Sending OBD-II request");

        let result = self
            .correlator
            .request(frame, matcher, self.config.timeout())
            .await;

        let mut stats = self.stats.lock();
        match result {
            Ok(response) => {
                stats.requests_sent += 1;
                stats.responses_received += 1;
                drop(stats);
                debug!(
                    ecu = %can_id_to_string(response.id, response.extended),
                    response = %hex::encode(&response.payload),
                    "Received OBD-II response"
                );
                if response.payload.is_empty() {
                    self.record_error();
                    return Err(ObdError::EmptyResponse);
                }
                Ok(response.payload.to_vec())
            }
            Err(CorrelatorError::Timeout(after)) => {
                stats.requests_sent += 1;
                stats.timeouts += 1;
                drop(stats);
                warn!(mode = %pid_to_string(mode), ?after, "OBD-II request timeout");
                Err(ObdError::Timeout(after))
            }
            Err(CorrelatorError::Transport(e)) => {
                stats.errors += 1;
                drop(stats);
                warn!(error = %e, "Failed to send OBD-II request");
                Err(e.into())
            }
        }
    }

    fn record_error(&self) {
        self.stats.lock().errors += 1;
    }

    /// Check the `[mode + 0x40, pid, ..]` echo, counting a mismatch as an error
    fn check_echo(&self, response: &[u8], mode: ObdMode, pid: u8) -> Result<(), ObdError> {
        let checked = match response {
            [] => Err(ObdError::EmptyResponse),
            [sid, ..] if *sid != mode.response_byte() => Err(ObdError::InvalidResponseSid {
                expected: mode.response_byte(),
                actual: *sid,
            }),
            [_] => Err(ObdError::Truncated { pid, len: 1 }),
            [_, echoed, ..] if *echoed != pid => Err(ObdError::InvalidResponsePid {
                expected: pid,
                actual: *echoed,
            }),
            _ => Ok(()),
        };
        if checked.is_err() {
            self.record_error();
        }
        checked
    }

    /// Mode 01 data bytes for `pid`, after the echo
    async fn query_current(&self, pid: u8) -> Result<Vec<u8>, ObdError> {
        let response = self.query(&[ObdMode::CurrentData.as_byte(), pid]).await?;
        self.check_echo(&response, ObdMode::CurrentData, pid)?;
        Ok(response[2..].to_vec())
    }

    fn decode(&self, pid: u8, data: &[u8], header_len: usize) -> Result<Parameter, ObdError> {
        Parameter::decode(pid, data).ok_or_else(|| {
            self.record_error();
            ObdError::Truncated {
                pid,
                len: data.len() + header_len,
            }
        })
    }

    /// Supported mode 01 PIDs, discovered once and cached
    pub async fn get_supported_pids(&self) -> Result<Vec<u8>, ObdError> {
        if let Some(cached) = self.supported_pids.lock().clone() {
            return Ok(cached);
        }
        self.refresh_supported_pids().await
    }

    /// Walk the support bitmaps (0x00, 0x20, 0x40, ..) again
    ///
    /// Each bitmap's last bit announces the next one. A missing, malformed
    /// or short answer ends the chain, so a silent ECU yields an empty list.
    /// Only a non-empty result is cached.
    pub async fn refresh_supported_pids(&self) -> Result<Vec<u8>, ObdError> {
        let mut supported = Vec::new();
        let mut base = pid::SUPPORTED_PIDS_01_20;

        loop {
            let bitmap = match self.query_current(base).await {
                Ok(bitmap) => bitmap,
                Err(e) => {
                    debug!(base = %pid_to_string(base), error = %e, "Support discovery stopped");
                    break;
                }
            };
            let Some(bitmap) = bitmap.get(..4) else {
                debug!(base = %pid_to_string(base), "Short support bitmap");
                break;
            };
            supported.extend(parse_supported_pids(bitmap, base));

            match base.checked_add(0x20) {
                Some(next) if next <= LAST_SUPPORT_BITMAP && supported.contains(&next) => {
                    base = next
                }
                _ => break,
            }
        }

        if supported.is_empty() {
            warn!("No supported PIDs reported");
            *self.supported_pids.lock() = None;
        } else {
            info!(count = supported.len(), "Discovered supported PIDs");
            *self.supported_pids.lock() = Some(supported.clone());
        }
        Ok(supported)
    }

    pub async fn is_pid_supported(&self, pid: u8) -> Result<bool, ObdError> {
        Ok(self.get_supported_pids().await?.contains(&pid))
    }

    /// Read and decode one mode 01 PID
    pub async fn read_parameter(&self, pid: u8) -> Result<Parameter, ObdError> {
        let data = self.query_current(pid).await?;
        self.decode(pid, &data, 2)
    }

    /// Read each PID in turn; failed reads are logged and left out
    pub async fn read_multiple_parameters(&self, pids: &[u8]) -> Vec<Parameter> {
        let mut parameters = Vec::with_capacity(pids.len());
        for &pid in pids {
            match self.read_parameter(pid).await {
                Ok(parameter) => parameters.push(parameter),
                Err(e) => debug!(pid = %pid_to_string(pid), error = %e, "Skipping parameter"),
            }
        }
        parameters
    }

    /// Mode 02: `pid` as captured in freeze frame `frame`
    pub async fn read_freeze_frame_parameter(
        &self,
        pid: u8,
        frame: u8,
    ) -> Result<Parameter, ObdError> {
        let response = self
            .query(&[ObdMode::FreezeFrameData.as_byte(), pid, frame])
            .await?;
        self.check_echo(&response, ObdMode::FreezeFrameData, pid)?;
        // [0x42, pid, frame, data..]
        let data = response.get(3..).unwrap_or_default();
        self.decode(pid, data, 3)
    }

    async fn read_value(&self, pid: u8) -> Result<f64, ObdError> {
        Ok(self.read_parameter(pid).await?.value)
    }

    pub async fn engine_rpm(&self) -> Result<f64, ObdError> {
        self.read_value(pid::ENGINE_RPM).await
    }

    pub async fn vehicle_speed(&self) -> Result<f64, ObdError> {
        self.read_value(pid::VEHICLE_SPEED).await
    }

    pub async fn coolant_temperature(&self) -> Result<f64, ObdError> {
        self.read_value(pid::COOLANT_TEMP).await
    }

    pub async fn engine_load(&self) -> Result<f64, ObdError> {
        self.read_value(pid::ENGINE_LOAD).await
    }

    pub async fn throttle_position(&self) -> Result<f64, ObdError> {
        self.read_value(pid::THROTTLE_POSITION).await
    }

    pub async fn fuel_level(&self) -> Result<f64, ObdError> {
        self.read_value(pid::FUEL_TANK_LEVEL).await
    }

    pub async fn intake_air_temperature(&self) -> Result<f64, ObdError> {
        self.read_value(pid::INTAKE_AIR_TEMP).await
    }

    pub async fn maf_airflow_rate(&self) -> Result<f64, ObdError> {
        self.read_value(pid::MAF_AIRFLOW_RATE).await
    }

    /// `[mode + 0x40, count, (high, low)*]`; zero entries are padding
    async fn read_dtcs(&self, mode: ObdMode) -> Result<Vec<Dtc>, ObdError> {
        let response = self.query(&[mode.as_byte()]).await?;
        if response[0] != mode.response_byte() {
            self.record_error();
            return Err(ObdError::InvalidResponseSid {
                expected: mode.response_byte(),
                actual: response[0],
            });
        }

        let count = response.get(1).copied().unwrap_or_default() as usize;
        let dtcs: Vec<Dtc> = response
            .get(2..)
            .unwrap_or_default()
            .chunks_exact(2)
            .take(count)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .filter(|raw| *raw != 0)
            .map(|raw| {
                let mut dtc = Dtc::from_raw(raw);
                match mode {
                    ObdMode::PendingDtcs => dtc.pending = true,
                    ObdMode::PermanentDtcs => dtc.permanent = true,
                    _ => dtc.confirmed = true,
                }
                dtc
            })
            .collect();

        debug!(%mode, count = dtcs.len(), "Read DTCs");
        Ok(dtcs)
    }

    /// Mode 03
    pub async fn read_stored_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        self.read_dtcs(ObdMode::StoredDtcs).await
    }

    /// Mode 07
    pub async fn read_pending_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        self.read_dtcs(ObdMode::PendingDtcs).await
    }

    /// Mode 0A
    pub async fn read_permanent_dtcs(&self) -> Result<Vec<Dtc>, ObdError> {
        self.read_dtcs(ObdMode::PermanentDtcs).await
    }

    /// Mode 04: clear stored DTCs and freeze frames, turn off the MIL
    pub async fn clear_dtcs(&self) -> Result<bool, ObdError> {
        let response = self.query(&[ObdMode::ClearDtcs.as_byte()]).await?;
        let cleared = response.first() == Some(&ObdMode::ClearDtcs.response_byte());
        if cleared {
            info!("DTCs cleared");
        }
        Ok(cleared)
    }

    /// Mode 09 text record: `[0x49, infoType, count, text..]`
    async fn read_vehicle_info(&self, info: u8) -> Result<Vec<u8>, ObdError> {
        let response = self
            .query(&[ObdMode::VehicleInformation.as_byte(), info])
            .await?;
        self.check_echo(&response, ObdMode::VehicleInformation, info)?;
        Ok(response.get(3..).unwrap_or_default().to_vec())
    }

    /// Alphanumeric characters of the mode 09 VIN record, at most 17
    pub async fn get_vin(&self) -> Result<String, ObdError> {
        let text = self.read_vehicle_info(info_type::VIN).await?;
        Ok(text
            .iter()
            .map(|b| *b as char)
            .filter(char::is_ascii_alphanumeric)
            .take(VIN_LENGTH)
            .collect())
    }

    pub async fn get_calibration_id(&self) -> Result<String, ObdError> {
        let text = self.read_vehicle_info(info_type::CALIBRATION_ID).await?;
        Ok(printable(&text))
    }

    pub async fn get_ecu_name(&self) -> Result<String, ObdError> {
        let text = self.read_vehicle_info(info_type::ECU_NAME).await?;
        Ok(printable(&text))
    }

    /// Poll `pids` every `interval` on a background task
    ///
    /// `callback` gets each non-empty batch. The task holds only a weak
    /// reference and ends when the client is dropped. Do not call
    /// [`ObdClient::stop_monitoring`] from inside the callback.
    pub fn start_monitoring<F>(
        self: &Arc<Self>,
        pids: Vec<u8>,
        interval: Duration,
        callback: F,
    ) -> Result<(), ObdError>
    where
        F: Fn(Vec<Parameter>) + Send + Sync + 'static,
    {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return Err(ObdError::AlreadyMonitoring);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(Self::run_monitor(
            Arc::downgrade(self),
            pids,
            interval,
            Arc::new(callback),
            stop.clone(),
            wake.clone(),
        ));
        *monitor = Some(Monitor { stop, wake, handle });
        Ok(())
    }

    async fn run_monitor(
        client: Weak<Self>,
        pids: Vec<u8>,
        interval: Duration,
        callback: MonitorCallback,
        stop: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) {
        info!(pids = pids.len(), ?interval, "Monitoring started");
        while !stop.load(Ordering::SeqCst) {
            let Some(strong) = client.upgrade() else {
                break;
            };
            let batch = strong.read_multiple_parameters(&pids).await;
            drop(strong);

            if !batch.is_empty() && !stop.load(Ordering::SeqCst) {
                callback(batch);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }
        info!("Monitoring stopped");
    }

    /// Signal the monitoring task and wait for it to finish its cycle
    ///
    /// Returns `false` when no monitoring was running.
    pub async fn stop_monitoring(&self) -> bool {
        let Some(monitor) = self.monitor.lock().take() else {
            return false;
        };
        monitor.stop.store(true, Ordering::SeqCst);
        monitor.wake.notify_one();
        if let Err(e) = monitor.handle.await {
            warn!(error = %e, "Monitoring task ended abnormally");
        }
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .map(|m| !m.handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ObdClient {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.stop.store(true, Ordering::SeqCst);
            monitor.handle.abort();
        }
    }
}

fn printable(text: &[u8]) -> String {
    text.iter()
        .map(|b| *b as char)
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::MockTransport;
    use crate::config::CanConfig;
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MockTransport>, Arc<ObdClient>) {
        let transport = Arc::new(MockTransport::new(&CanConfig::default()));
        let config = ObdConfig {
            timeout_ms: 50,
            ..Default::default()
        };
        let client = Arc::new(ObdClient::new(config, transport.clone()));
        (transport, client)
    }

    fn reply(payload: &[u8]) -> CanFrame {
        CanFrame::new(0x7E8, payload)
    }

    #[tokio::test]
    async fn test_read_rpm() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x0C], reply(&[0x41, 0x0C, 0x0D, 0x48]));

        let param = client.read_parameter(pid::ENGINE_RPM).await.unwrap();
        assert_eq!(param.value, 850.0);
        assert_eq!(param.unit, "RPM");
        assert_eq!(param.raw_data, vec![0x0D, 0x48]);
        assert_eq!(client.engine_rpm().await.unwrap(), 850.0);

        let sent = transport.sent_frames();
        assert_eq!(sent[0].id, 0x7DF);
        assert_eq!(&sent[0].payload[..], &[0x01, 0x0C]);
    }

    #[tokio::test]
    async fn test_answer_from_any_configured_ecu() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x0D], CanFrame::new(0x7EA, &[0x41, 0x0D, 0x32]));

        assert_eq!(client.vehicle_speed().await.unwrap(), 50.0);
    }

    #[tokio::test]
    async fn test_wrong_pid_echo_is_error() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x05], reply(&[0x41, 0x0C, 0x7B]));

        let err = client.read_parameter(pid::COOLANT_TEMP).await.unwrap_err();
        assert_eq!(
            err,
            ObdError::InvalidResponsePid {
                expected: 0x05,
                actual: 0x0C
            }
        );
        assert_eq!(client.statistics().errors, 1);
    }

    #[tokio::test]
    async fn test_short_rpm_response_is_error() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x0C], reply(&[0x41, 0x0C, 0x0D]));

        let err = client.read_parameter(pid::ENGINE_RPM).await.unwrap_err();
        assert_eq!(err, ObdError::Truncated { pid: 0x0C, len: 3 });
    }

    #[tokio::test]
    async fn test_timeout_counts_once() {
        let (_transport, client) = setup();

        let err = client.read_parameter(pid::VEHICLE_SPEED).await.unwrap_err();
        assert!(matches!(err, ObdError::Timeout(_)));
        let stats = client.statistics();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.responses_received, 0);
    }

    #[tokio::test]
    async fn test_supported_pid_chain_is_cached() {
        let (transport, client) = setup();
        // 0x0C, 0x0D and 0x20 supported
        transport.add_response(&[0x01, 0x00], reply(&[0x41, 0x00, 0x00, 0x18, 0x00, 0x01]));
        // 0x21 supported, 0x40 not
        transport.add_response(&[0x01, 0x20], reply(&[0x41, 0x20, 0x80, 0x00, 0x00, 0x00]));

        let pids = client.get_supported_pids().await.unwrap();
        assert_eq!(pids, vec![0x0C, 0x0D, 0x20, 0x21]);
        assert!(client.is_pid_supported(0x0D).await.unwrap());
        assert!(!client.is_pid_supported(0x05).await.unwrap());
        // two bitmap requests, none after the cache is filled
        assert_eq!(transport.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_supported_pid_chain_stops_on_silence() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x00], reply(&[0x41, 0x00, 0x00, 0x00, 0x00, 0x01]));

        let pids = client.get_supported_pids().await.unwrap();
        assert_eq!(pids, vec![0x20]);
    }

    #[tokio::test]
    async fn test_supported_pids_empty_when_ecu_silent() {
        let (transport, client) = setup();

        assert_eq!(client.get_supported_pids().await.unwrap(), Vec::<u8>::new());
        assert_eq!(client.statistics().timeouts, 1);

        // Nothing cached: the next call asks again and sees the answer
        transport.add_response(&[0x01, 0x00], reply(&[0x41, 0x00, 0x00, 0x08, 0x00, 0x00]));
        assert_eq!(client.get_supported_pids().await.unwrap(), vec![0x0D]);
        assert_eq!(transport.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_supported_pids_empty_on_wrong_echo() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x00], reply(&[0x41, 0x20, 0xFF, 0xFF, 0xFF, 0xFF]));

        assert!(client.refresh_supported_pids().await.unwrap().is_empty());
        assert!(!client.is_pid_supported(0x0C).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_multiple_skips_failures() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x0C], reply(&[0x41, 0x0C, 0x1A, 0xF8]));
        transport.add_response(&[0x01, 0x05], reply(&[0x41, 0x05, 0x82]));

        let params = client
            .read_multiple_parameters(&[0x0C, 0x0F, 0x05])
            .await;
        let pids: Vec<u8> = params.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![0x0C, 0x05]);
        assert_eq!(params[1].formatted_value(), "90.00 °C");
    }

    #[tokio::test]
    async fn test_read_stored_dtcs() {
        let (transport, client) = setup();
        // two codes and one padding entry
        transport.add_response(
            &[0x03],
            reply(&[0x43, 0x03, 0x00, 0xAB, 0x00, 0x00, 0xC0, 0x64]),
        );

        let dtcs = client.read_stored_dtcs().await.unwrap();
        let codes: Vec<&str> = dtcs.iter().map(|d| d.code.as_str()).collect();
        assert_eq!(codes, vec!["P0171", "U0100"]);
        assert!(dtcs.iter().all(|d| d.confirmed && !d.pending));
    }

    #[tokio::test]
    async fn test_dtc_count_bounds_parsing() {
        let (transport, client) = setup();
        transport.add_response(&[0x07], reply(&[0x47, 0x01, 0x01, 0x2C, 0x01, 0xA4]));
        transport.add_response(&[0x0A], reply(&[0x4A, 0x02, 0x04, 0x20]));

        let pending = client.read_pending_dtcs().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].code, "P0300");
        assert!(pending[0].pending);

        let permanent = client.read_permanent_dtcs().await.unwrap();
        assert_eq!(permanent.len(), 1);
        assert!(permanent[0].permanent);
    }

    #[tokio::test]
    async fn test_clear_dtcs() {
        let (transport, client) = setup();
        transport.add_response(&[0x04], reply(&[0x44]));

        assert!(client.clear_dtcs().await.unwrap());
    }

    #[tokio::test]
    async fn test_get_vin() {
        let (transport, client) = setup();
        let mut payload = vec![0x49, 0x02, 0x01];
        payload.extend_from_slice(b"\x001HGCM82633A004352");
        transport.add_response(&[0x09, 0x02], reply(&payload));

        assert_eq!(client.get_vin().await.unwrap(), "1HGCM82633A004352");
    }

    #[tokio::test]
    async fn test_freeze_frame_parameter() {
        let (transport, client) = setup();
        transport.add_response(&[0x02, 0x0D, 0x00], reply(&[0x42, 0x0D, 0x00, 0x64]));

        let param = client.read_freeze_frame_parameter(0x0D, 0).await.unwrap();
        assert_eq!(param.value, 100.0);
    }

    #[tokio::test]
    async fn test_monitoring_delivers_batches_until_stopped() {
        let (transport, client) = setup();
        transport.add_response(&[0x01, 0x0D], reply(&[0x41, 0x0D, 0x3C]));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        client
            .start_monitoring(vec![0x0D], Duration::from_millis(10), move |batch| {
                let _ = tx.send(batch);
            })
            .unwrap();
        assert!(client.is_monitoring());
        assert_eq!(
            client.start_monitoring(vec![0x0D], Duration::from_millis(10), |_| {}),
            Err(ObdError::AlreadyMonitoring)
        );

        let batch = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch[0].value, 60.0);

        assert!(client.stop_monitoring().await);
        assert!(!client.is_monitoring());
        assert!(!client.stop_monitoring().await);
    }
}
