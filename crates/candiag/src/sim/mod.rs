//! Simulated ECU
//!
//! A [`SimulatedEcu`] answers UDS requests on its physical request id and
//! OBD-II requests on the functional broadcast id. Attach it to a
//! [`MockTransport`](crate::can::MockTransport) with `add_responder` to get a
//! complete target for the clients and the flash manager:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use candiag::can::MockTransport;
//! # use candiag::config::CanConfig;
//! # use candiag::sim::{SimConfig, SimulatedEcu};
//! let transport = Arc::new(MockTransport::new(&CanConfig::default()));
//! let ecu = Arc::new(SimulatedEcu::new(SimConfig::default()));
//! transport.add_responder(ecu.clone());
//! ```
//!
//! Memory is sparse: bytes never written read back as erased (0xFF).

mod obd;
mod uds;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::can::{CanFrame, FrameResponder};
use crate::dtc::encode_dtc;
use crate::obd::{pid, ObdMode};
use crate::uds::{dtc_status_bit, standard_did, DtcInfo};

pub use uds::{negative_response, positive_response};

/// Value of erased flash
pub const ERASED: u8 = 0xFF;

/// Identity and behaviour of a simulated ECU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Physical UDS request id
    #[serde(default = "default_request_id")]
    pub request_id: u32,
    /// Id the ECU answers on
    #[serde(default = "default_response_id")]
    pub response_id: u32,
    /// Functional OBD-II request id
    #[serde(default = "default_obd_request_id")]
    pub obd_request_id: u32,
    #[serde(default)]
    pub extended_ids: bool,
    /// Shared secret of the XOR seed/key algorithm
    #[serde(default = "default_security_secret")]
    pub security_secret: Vec<u8>,
    /// maxNumberOfBlockLength announced for downloads and uploads
    #[serde(default = "default_max_block_length")]
    pub max_block_length: u32,
    #[serde(default = "default_block_counter_start")]
    pub block_counter_start: u8,
    /// Counter value after 0xFF
    #[serde(default)]
    pub block_counter_wrap: u8,
    #[serde(default = "default_vin")]
    pub vin: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            obd_request_id: default_obd_request_id(),
            extended_ids: false,
            security_secret: default_security_secret(),
            max_block_length: default_max_block_length(),
            block_counter_start: default_block_counter_start(),
            block_counter_wrap: 0,
            vin: default_vin(),
        }
    }
}

fn default_request_id() -> u32 {
    0x7E0
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_obd_request_id() -> u32 {
    0x7DF
}

fn default_security_secret() -> Vec<u8> {
    vec![0xA5, 0x5A, 0x3C, 0xC3]
}

fn default_max_block_length() -> u32 {
    0x0402
}

fn default_block_counter_start() -> u8 {
    1
}

fn default_vin() -> String {
    "1HGBH41JXMN109186".to_string()
}

/// An active RequestDownload
#[derive(Debug)]
struct DownloadState {
    address: u32,
    total_size: u32,
    received: u32,
}

/// An active RequestUpload
#[derive(Debug)]
struct UploadState {
    address: u32,
    buffer: Vec<u8>,
    sent: usize,
    next_block: u8,
}

/// Mutable ECU state, guarded as one unit
struct EcuState {
    session: u8,
    security_unlocked: bool,
    seed: Option<Vec<u8>>,
    dids: BTreeMap<u16, Vec<u8>>,
    dtcs: Vec<DtcInfo>,
    pids: BTreeMap<u8, Vec<u8>>,
    stored_codes: Vec<u16>,
    pending_codes: Vec<u16>,
    permanent_codes: Vec<u16>,
    memory: BTreeMap<u32, u8>,
    download: Option<DownloadState>,
    upload: Option<UploadState>,
    /// Expected download sequence counter; runs on across downloads of a
    /// session
    download_block: u8,
}

/// UDS and OBD-II responder backed by in-memory state
pub struct SimulatedEcu {
    config: SimConfig,
    state: Mutex<EcuState>,
    silent: AtomicBool,
    write_fault: Mutex<Option<u32>>,
    erase_count: AtomicUsize,
}

impl SimulatedEcu {
    pub fn new(config: SimConfig) -> Self {
        let mut dids = BTreeMap::new();
        dids.insert(standard_did::VIN, config.vin.as_bytes().to_vec());
        dids.insert(standard_did::ECU_SOFTWARE_VERSION, b"1.0.0".to_vec());
        dids.insert(standard_did::ECU_SERIAL_NUMBER, b"SIM-000001".to_vec());
        dids.insert(standard_did::SPARE_PART_NUMBER, b"CD-100-200".to_vec());

        // P0171 System too lean, confirmed and failing
        let mut lean = DtcInfo::new(
            0x00AB00,
            dtc_status_bit::TEST_FAILED | dtc_status_bit::CONFIRMED_DTC,
        );
        // record 1: one identifier, 0xF40D vehicle speed = 50 km/h
        lean.snapshot_data = vec![0x01, 0x01, 0xF4, 0x0D, 0x32];
        // record 1: occurrence counter
        lean.extended_data = vec![0x01, 0x03];
        let dtcs = vec![
            lean,
            // P0300 Random misfire, pending
            DtcInfo::new(0x012C00, dtc_status_bit::PENDING_DTC),
        ];

        let mut pids = BTreeMap::new();
        pids.insert(pid::ENGINE_LOAD, vec![0x80]);
        pids.insert(pid::COOLANT_TEMP, vec![0x5A]);
        pids.insert(pid::ENGINE_RPM, vec![0x0D, 0x48]);
        pids.insert(pid::VEHICLE_SPEED, vec![0x32]);
        pids.insert(pid::INTAKE_AIR_TEMP, vec![0x46]);
        pids.insert(pid::MAF_AIRFLOW_RATE, vec![0x01, 0xF4]);
        pids.insert(pid::THROTTLE_POSITION, vec![0x40]);
        pids.insert(pid::RUNTIME_SINCE_ENGINE_START, vec![0x01, 0x2C]);
        pids.insert(pid::FUEL_TANK_LEVEL, vec![0x99]);
        pids.insert(pid::ABSOLUTE_BAROMETRIC_PRESSURE, vec![0x65]);

        let codes = |list: &[&str]| -> Vec<u16> {
            list.iter().filter_map(|c| encode_dtc(c)).collect()
        };

        info!(
            request_id = format!("0x{:03X}", config.request_id),
            dids = dids.len(),
            dtcs = dtcs.len(),
            pids = pids.len(),
            "Created simulated ECU"
        );

        let state = EcuState {
            session: 0x01,
            security_unlocked: false,
            seed: None,
            dids,
            dtcs,
            pids,
            stored_codes: codes(&["P0171", "P0300"]),
            pending_codes: codes(&["P0420"]),
            permanent_codes: codes(&["P0171"]),
            memory: BTreeMap::new(),
            download: None,
            upload: None,
            download_block: config.block_counter_start,
        };

        Self {
            config,
            state: Mutex::new(state),
            silent: AtomicBool::new(false),
            write_fault: Mutex::new(None),
            erase_count: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Current session byte (0x01 default, 0x02 programming, ..)
    pub fn session(&self) -> u8 {
        self.state.lock().session
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.lock().security_unlocked
    }

    /// `len` bytes of memory from `address`
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        (0..len)
            .map(|i| read_byte(&state.memory, address.wrapping_add(i as u32)))
            .collect()
    }

    /// Preload memory, bypassing the transfer services
    pub fn write_memory(&self, address: u32, data: &[u8]) {
        let mut state = self.state.lock();
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(address.wrapping_add(i as u32), *byte);
        }
    }

    /// Store the complement of whatever is downloaded to `address`
    pub fn set_write_fault(&self, address: Option<u32>) {
        *self.write_fault.lock() = address;
    }

    /// Stop answering anything
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Completed erase routines
    pub fn erase_count(&self) -> usize {
        self.erase_count.load(Ordering::SeqCst)
    }

    /// Set the data bytes of a mode 01 PID
    pub fn set_pid(&self, pid: u8, data: &[u8]) {
        self.state.lock().pids.insert(pid, data.to_vec());
    }

    pub fn remove_pid(&self, pid: u8) {
        self.state.lock().pids.remove(&pid);
    }

    pub fn set_did(&self, did: u16, data: &[u8]) {
        self.state.lock().dids.insert(did, data.to_vec());
    }

    pub fn did(&self, did: u16) -> Option<Vec<u8>> {
        self.state.lock().dids.get(&did).cloned()
    }

    pub fn add_dtc(&self, dtc: DtcInfo) {
        self.state.lock().dtcs.push(dtc);
    }

    pub fn dtc_count(&self) -> usize {
        self.state.lock().dtcs.len()
    }

    fn frame(&self, payload: &[u8]) -> CanFrame {
        CanFrame::with_id_type(self.config.response_id, self.config.extended_ids, payload)
    }
}

fn read_byte(memory: &BTreeMap<u32, u8>, address: u32) -> u8 {
    memory.get(&address).copied().unwrap_or(ERASED)
}

/// OBD-II service modes are 0x01..=0x0A; UDS services start at 0x10
fn is_obd_mode(byte: u8) -> bool {
    ObdMode::from_byte(byte).is_some()
}

impl FrameResponder for SimulatedEcu {
    fn respond(&self, request: &CanFrame) -> Vec<CanFrame> {
        if self.silent.load(Ordering::SeqCst) || request.extended != self.config.extended_ids {
            return Vec::new();
        }
        let payload = request.payload.as_ref();
        let Some(&first) = payload.first() else {
            return Vec::new();
        };

        let response = if request.id == self.config.obd_request_id
            || (request.id == self.config.request_id && is_obd_mode(first))
        {
            self.process_obd_request(payload)
        } else if request.id == self.config.request_id {
            self.process_request(payload)
        } else {
            return Vec::new();
        };

        if response.is_empty() {
            debug!(request = %hex::encode(payload), "Simulated ECU: no response");
            return Vec::new();
        }
        vec![self.frame(&response)]
    }
}
