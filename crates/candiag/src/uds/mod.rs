//! UDS (Unified Diagnostic Services, ISO 14229) client
//!
//! This module provides the UDS protocol layer for communicating with ECUs:
//! service constants, session/reset types, NRC table, DTC records and the
//! [`UdsClient`] state machine.

mod client;
pub mod dtc;
mod error;
mod nrc;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{xor_key, UdsClient, UdsStatistics};
pub use dtc::{dtc_group, status_bit as dtc_status_bit, DtcInfo, DtcRecordKind, DtcStatus};
pub use error::{ErrorInfo, UdsError};
pub use nrc::NegativeResponseCode;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    /// Start routine
    pub const START_ROUTINE: u8 = 0x01;
    /// Stop routine
    pub const STOP_ROUTINE: u8 = 0x02;
    /// Request routine results
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Well-known routine identifiers
pub mod routine_id {
    /// Erase memory: `[addressAndLengthFormat, address.., size..]`
    pub const ERASE_MEMORY: u16 = 0xFF00;
    /// Check programming dependencies
    pub const CHECK_PROGRAMMING_DEPENDENCIES: u16 = 0xFF01;
}

/// InputOutputControlById (0x2F) control parameters
pub mod io_control_option {
    /// Return control to ECU - release tester control
    pub const RETURN_CONTROL_TO_ECU: u8 = 0x00;
    /// Reset output to default value
    pub const RESET_TO_DEFAULT: u8 = 0x01;
    /// Freeze current state
    pub const FREEZE_CURRENT_STATE: u8 = 0x02;
    /// Short-term adjustment - set specific value
    pub const SHORT_TERM_ADJUSTMENT: u8 = 0x03;
}

/// Standard UDS Data Identifiers (ISO 14229-1 Annex C)
pub mod standard_did {
    pub const BOOT_SOFTWARE_ID: u16 = 0xF180;
    pub const APPLICATION_SOFTWARE_ID: u16 = 0xF181;
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    pub const SPARE_PART_NUMBER: u16 = 0xF187;
    pub const ECU_SOFTWARE_NUMBER: u16 = 0xF188;
    pub const ECU_SOFTWARE_VERSION: u16 = 0xF189;
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    pub const VIN: u16 = 0xF190;
    pub const ECU_HARDWARE_NUMBER: u16 = 0xF191;
}

/// Diagnostic session (0x10 sub-function)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Default,
    Programming,
    ExtendedDiagnostic,
    SafetySystem,
}

impl SessionType {
    pub fn as_byte(&self) -> u8 {
        match self {
            SessionType::Default => 0x01,
            SessionType::Programming => 0x02,
            SessionType::ExtendedDiagnostic => 0x03,
            SessionType::SafetySystem => 0x04,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(SessionType::Default),
            0x02 => Some(SessionType::Programming),
            0x03 => Some(SessionType::ExtendedDiagnostic),
            0x04 => Some(SessionType::SafetySystem),
            _ => None,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionType::Default => "Default",
            SessionType::Programming => "Programming",
            SessionType::ExtendedDiagnostic => "ExtendedDiagnostic",
            SessionType::SafetySystem => "SafetySystemDiagnostic",
        };
        f.write_str(s)
    }
}

/// ECUReset (0x11) sub-functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetType {
    /// Complete shutdown and restart of ECU
    Hard,
    /// Simulated ignition cycle
    KeyOffOn,
    /// Application-level restart
    Soft,
    EnableRapidPowerShutdown,
    DisableRapidPowerShutdown,
}

impl ResetType {
    pub fn as_byte(&self) -> u8 {
        match self {
            ResetType::Hard => 0x01,
            ResetType::KeyOffOn => 0x02,
            ResetType::Soft => 0x03,
            ResetType::EnableRapidPowerShutdown => 0x04,
            ResetType::DisableRapidPowerShutdown => 0x05,
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ResetType::Hard),
            0x02 => Some(ResetType::KeyOffOn),
            0x03 => Some(ResetType::Soft),
            0x04 => Some(ResetType::EnableRapidPowerShutdown),
            0x05 => Some(ResetType::DisableRapidPowerShutdown),
            _ => None,
        }
    }
}

/// RoutineControl (0x31) control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineControlType {
    Start,
    Stop,
    RequestResults,
}

impl RoutineControlType {
    pub fn as_byte(&self) -> u8 {
        match self {
            RoutineControlType::Start => routine_sub_function::START_ROUTINE,
            RoutineControlType::Stop => routine_sub_function::STOP_ROUTINE,
            RoutineControlType::RequestResults => routine_sub_function::REQUEST_ROUTINE_RESULTS,
        }
    }
}

/// Display name of a service id
pub fn service_name(sid: u8) -> &'static str {
    match sid {
        service_id::DIAGNOSTIC_SESSION_CONTROL => "DiagnosticSessionControl",
        service_id::ECU_RESET => "ECUReset",
        service_id::CLEAR_DIAGNOSTIC_INFO => "ClearDiagnosticInformation",
        service_id::READ_DTC_INFO => "ReadDTCInformation",
        service_id::READ_DATA_BY_ID => "ReadDataByIdentifier",
        service_id::READ_MEMORY_BY_ADDRESS => "ReadMemoryByAddress",
        service_id::SECURITY_ACCESS => "SecurityAccess",
        service_id::COMMUNICATION_CONTROL => "CommunicationControl",
        service_id::WRITE_DATA_BY_ID => "WriteDataByIdentifier",
        service_id::IO_CONTROL_BY_ID => "InputOutputControlByIdentifier",
        service_id::ROUTINE_CONTROL => "RoutineControl",
        service_id::REQUEST_DOWNLOAD => "RequestDownload",
        service_id::REQUEST_UPLOAD => "RequestUpload",
        service_id::TRANSFER_DATA => "TransferData",
        service_id::REQUEST_TRANSFER_EXIT => "RequestTransferExit",
        service_id::TESTER_PRESENT => "TesterPresent",
        service_id::CONTROL_DTC_SETTING => "ControlDTCSetting",
        _ => "Unknown",
    }
}

/// DID 0x0000 is reserved
pub fn is_valid_data_identifier(did: u16) -> bool {
    did != 0x0000
}

pub fn encode_data_identifier(did: u16) -> [u8; 2] {
    did.to_be_bytes()
}

/// Big-endian DID at `offset`, `None` when fewer than two bytes remain
pub fn decode_data_identifier(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_type_bytes() {
        for session in [
            SessionType::Default,
            SessionType::Programming,
            SessionType::ExtendedDiagnostic,
            SessionType::SafetySystem,
        ] {
            assert_eq!(SessionType::from_byte(session.as_byte()), Some(session));
        }
        assert_eq!(SessionType::from_byte(0x05), None);
        assert_eq!(SessionType::Programming.to_string(), "Programming");
    }

    #[test]
    fn test_reset_type_bytes() {
        assert_eq!(ResetType::Hard.as_byte(), 0x01);
        assert_eq!(ResetType::DisableRapidPowerShutdown.as_byte(), 0x05);
        assert_eq!(ResetType::from_byte(0x03), Some(ResetType::Soft));
        assert_eq!(ResetType::from_byte(0x00), None);
    }

    #[test]
    fn test_data_identifier_helpers() {
        assert!(!is_valid_data_identifier(0x0000));
        assert!(is_valid_data_identifier(0xF190));
        assert_eq!(encode_data_identifier(0xF190), [0xF1, 0x90]);
        assert_eq!(decode_data_identifier(&[0x00, 0xF1, 0x90], 1), Some(0xF190));
        assert_eq!(decode_data_identifier(&[0xF1], 0), None);
        assert_eq!(decode_data_identifier(&[0xF1, 0x90], usize::MAX), None);
    }

    #[test]
    fn test_service_names() {
        assert_eq!(service_name(0x27), "SecurityAccess");
        assert_eq!(service_name(0x36), "TransferData");
        assert_eq!(service_name(0xAA), "Unknown");
    }
}
