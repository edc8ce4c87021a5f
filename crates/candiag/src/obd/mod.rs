//! OBD-II (SAE J1979) client
//!
//! Requests go to the functional broadcast id (0x7DF by default) and are
//! answered by whichever emissions ECU (0x7E8-0x7EF) supports them. A
//! positive response echoes `mode + 0x40`; OBD has no negative response, so
//! an unsupported request simply times out.

mod client;
mod error;
pub mod pid;

use std::fmt;

use serde::Serialize;

pub use client::{MonitorCallback, ObdClient, ObdStatistics};
pub use error::ObdError;
pub use pid::{
    decode_pid, parse_supported_pids, pid_description, pid_info, pid_to_string, Parameter,
    PidInfo, PID_TABLE,
};

/// Offset added to the mode in a positive response
pub const RESPONSE_OFFSET: u8 = 0x40;

/// Service modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObdMode {
    CurrentData,
    FreezeFrameData,
    StoredDtcs,
    ClearDtcs,
    O2SensorMonitoring,
    OnBoardMonitoring,
    PendingDtcs,
    ControlOperations,
    VehicleInformation,
    PermanentDtcs,
}

impl ObdMode {
    pub fn as_byte(&self) -> u8 {
        match self {
            ObdMode::CurrentData => 0x01,
            ObdMode::FreezeFrameData => 0x02,
            ObdMode::StoredDtcs => 0x03,
            ObdMode::ClearDtcs => 0x04,
            ObdMode::O2SensorMonitoring => 0x05,
            ObdMode::OnBoardMonitoring => 0x06,
            ObdMode::PendingDtcs => 0x07,
            ObdMode::ControlOperations => 0x08,
            ObdMode::VehicleInformation => 0x09,
            ObdMode::PermanentDtcs => 0x0A,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ObdMode::CurrentData),
            0x02 => Some(ObdMode::FreezeFrameData),
            0x03 => Some(ObdMode::StoredDtcs),
            0x04 => Some(ObdMode::ClearDtcs),
            0x05 => Some(ObdMode::O2SensorMonitoring),
            0x06 => Some(ObdMode::OnBoardMonitoring),
            0x07 => Some(ObdMode::PendingDtcs),
            0x08 => Some(ObdMode::ControlOperations),
            0x09 => Some(ObdMode::VehicleInformation),
            0x0A => Some(ObdMode::PermanentDtcs),
            _ => None,
        }
    }

    /// Mode byte of the positive response
    pub fn response_byte(&self) -> u8 {
        self.as_byte() + RESPONSE_OFFSET
    }
}

impl fmt::Display for ObdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObdMode::CurrentData => "CurrentData",
            ObdMode::FreezeFrameData => "FreezeFrameData",
            ObdMode::StoredDtcs => "StoredDTCs",
            ObdMode::ClearDtcs => "ClearDTCs",
            ObdMode::O2SensorMonitoring => "O2SensorMonitoring",
            ObdMode::OnBoardMonitoring => "OnBoardMonitoring",
            ObdMode::PendingDtcs => "PendingDTCs",
            ObdMode::ControlOperations => "ControlOperations",
            ObdMode::VehicleInformation => "VehicleInformation",
            ObdMode::PermanentDtcs => "PermanentDTCs",
        };
        f.write_str(s)
    }
}

/// Mode 09 info types
pub mod info_type {
    pub const VIN: u8 = 0x02;
    pub const CALIBRATION_ID: u8 = 0x04;
    pub const ECU_NAME: u8 = 0x0A;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bytes() {
        for value in 0x01..=0x0A {
            let mode = ObdMode::from_byte(value).unwrap();
            assert_eq!(mode.as_byte(), value);
        }
        assert_eq!(ObdMode::from_byte(0x0B), None);
        assert_eq!(ObdMode::StoredDtcs.response_byte(), 0x43);
        assert_eq!(ObdMode::PermanentDtcs.to_string(), "PermanentDTCs");
    }

    #[test]
    fn test_pid_constants_reachable_from_module() {
        assert_eq!(pid::ENGINE_RPM, 0x0C);
        assert_eq!(pid::pid::VEHICLE_SPEED, pid::VEHICLE_SPEED);
        assert_eq!(pid_info(pid::ENGINE_LOAD).map(|i| i.name), Some("ENGINE_LOAD"));
    }
}
