//! OBD-II modes of the simulated ECU

use tracing::{debug, info};

use super::{EcuState, SimulatedEcu};
use crate::obd::{info_type, ObdMode};

/// Highest support bitmap PID (0xC0 announces 0xC1-0xE0)
const LAST_SUPPORT_BITMAP: u8 = 0xC0;

/// Four byte bitmap of the PIDs `base + 1 ..= base + 0x20` this ECU serves
///
/// Bit `base + 0x20` is set whenever any higher PID exists, so a tester can
/// follow the chain.
fn support_bitmap(state: &EcuState, base: u8) -> [u8; 4] {
    let mut bits: u32 = 0;
    for &pid in state.pids.keys() {
        if pid > base && u16::from(pid) <= u16::from(base) + 0x20 {
            bits |= 1 << (0x20 - (pid - base));
        }
    }
    let next = u16::from(base) + 0x20;
    if state.pids.keys().any(|&pid| u16::from(pid) > next) {
        bits |= 1;
    }
    bits.to_be_bytes()
}

fn is_support_pid(pid: u8) -> bool {
    pid % 0x20 == 0 && pid <= LAST_SUPPORT_BITMAP
}

/// Whether the support bitmap at `base` is announced by the one before it
fn bitmap_announced(state: &EcuState, base: u8) -> bool {
    base == 0 || state.pids.keys().any(|&pid| pid > base)
}

/// `[mode + 0x40, count, (high, low)*]`
fn dtc_response(mode: ObdMode, codes: &[u16]) -> Vec<u8> {
    let mut response = vec![mode.response_byte(), codes.len() as u8];
    for code in codes {
        response.extend_from_slice(&code.to_be_bytes());
    }
    response
}

impl SimulatedEcu {
    /// Answer one OBD-II request; unsupported requests get no response
    pub fn process_obd_request(&self, request: &[u8]) -> Vec<u8> {
        let Some(mode) = request.first().copied().and_then(ObdMode::from_byte) else {
            return Vec::new();
        };
        let mut state = self.state.lock();

        let response = match mode {
            ObdMode::CurrentData => current_data(&state, request),
            ObdMode::FreezeFrameData => freeze_frame(&state, request),
            ObdMode::StoredDtcs => dtc_response(mode, &state.stored_codes),
            ObdMode::PendingDtcs => dtc_response(mode, &state.pending_codes),
            ObdMode::PermanentDtcs => dtc_response(mode, &state.permanent_codes),
            ObdMode::ClearDtcs => {
                // Permanent codes survive a clear
                state.stored_codes.clear();
                state.pending_codes.clear();
                info!("OBD-II: DTCs cleared");
                vec![mode.response_byte()]
            }
            ObdMode::VehicleInformation => self.vehicle_information(request),
            _ => Vec::new(),
        };

        if response.is_empty() {
            debug!(request = %hex::encode(request), "OBD-II request not supported");
        }
        response
    }

    fn vehicle_information(&self, request: &[u8]) -> Vec<u8> {
        let Some(&info) = request.get(1) else {
            return Vec::new();
        };
        let text: &[u8] = match info {
            info_type::VIN => self.config.vin.as_bytes(),
            info_type::CALIBRATION_ID => b"CANDIAG-SIM-CAL1",
            info_type::ECU_NAME => b"ECM-EngineControl",
            _ => return Vec::new(),
        };
        // One data item
        let mut response = vec![ObdMode::VehicleInformation.response_byte(), info, 0x01];
        response.extend_from_slice(text);
        response
    }
}

fn current_data(state: &EcuState, request: &[u8]) -> Vec<u8> {
    let Some(&pid) = request.get(1) else {
        return Vec::new();
    };
    let mut response = vec![ObdMode::CurrentData.response_byte(), pid];
    if is_support_pid(pid) {
        if !bitmap_announced(state, pid) {
            return Vec::new();
        }
        response.extend_from_slice(&support_bitmap(state, pid));
        return response;
    }
    match state.pids.get(&pid) {
        Some(data) => {
            response.extend_from_slice(data);
            response
        }
        None => Vec::new(),
    }
}

/// Frame 0 holds the values captured with the first stored DTC; the
/// simulation reports the current values
fn freeze_frame(state: &EcuState, request: &[u8]) -> Vec<u8> {
    let (Some(&pid), Some(&frame)) = (request.get(1), request.get(2)) else {
        return Vec::new();
    };
    if frame != 0 || state.stored_codes.is_empty() {
        return Vec::new();
    }
    match state.pids.get(&pid) {
        Some(data) => {
            let mut response = vec![ObdMode::FreezeFrameData.response_byte(), pid, frame];
            response.extend_from_slice(data);
            response
        }
        None => Vec::new(),
    }
}
