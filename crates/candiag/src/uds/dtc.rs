//! DTC records for UDS service 0x19 (ReadDTCInformation)
//!
//! UDS carries DTCs as three bytes plus a status byte. The top two bytes are
//! the SAE code (see [`crate::dtc`]), the low byte the failure type.

use serde::Serialize;

use crate::dtc::{decode_dtc, Dtc, DtcCategory};

/// Sub-function codes for ReadDTCInformation (0x19)
pub mod sub_function {
    /// Report number of DTCs matching a status mask
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    /// Report DTCs matching a status mask
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
    /// Report DTC snapshot record by DTC number
    pub const REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER: u8 = 0x04;
    /// Report DTC extended data record by DTC number
    pub const REPORT_DTC_EXTENDED_DATA_RECORD_BY_DTC_NUMBER: u8 = 0x06;
    /// Report supported DTCs
    pub const REPORT_SUPPORTED_DTC: u8 = 0x0A;
}

/// DTC group addresses for ClearDiagnosticInformation (0x14)
pub mod dtc_group {
    /// All DTC groups (clear all)
    pub const ALL: u32 = 0xFFFFFF;
    /// Powertrain group (P codes)
    pub const POWERTRAIN: u32 = 0x000000;
    /// Chassis group (C codes)
    pub const CHASSIS: u32 = 0x400000;
    /// Body group (B codes)
    pub const BODY: u32 = 0x800000;
    /// Network group (U codes)
    pub const NETWORK: u32 = 0xC00000;
}

/// DTC status byte bit definitions per ISO 14229-1
pub mod status_bit {
    /// Bit 0: Test Failed - DTC test failed this operation cycle
    pub const TEST_FAILED: u8 = 0x01;
    /// Bit 1: Test Failed This Operation Cycle
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    /// Bit 2: Pending DTC - Test failed but not yet confirmed
    pub const PENDING_DTC: u8 = 0x04;
    /// Bit 3: Confirmed DTC - Malfunction confirmed and stored
    pub const CONFIRMED_DTC: u8 = 0x08;
    /// Bit 4: Test Not Completed Since Last Clear
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    /// Bit 5: Test Failed Since Last Clear
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    /// Bit 6: Test Not Completed This Operation Cycle
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    /// Bit 7: Warning Indicator Requested
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;
}

/// Parsed DTC status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DtcStatus {
    pub test_failed: bool,
    pub test_failed_this_operation_cycle: bool,
    pub pending_dtc: bool,
    pub confirmed_dtc: bool,
    pub test_not_completed_since_last_clear: bool,
    pub test_failed_since_last_clear: bool,
    pub test_not_completed_this_operation_cycle: bool,
    /// MIL requested
    pub warning_indicator_requested: bool,
    pub raw: u8,
}

impl DtcStatus {
    pub fn from_byte(status: u8) -> Self {
        let bit = |mask: u8| status & mask != 0;
        Self {
            test_failed: bit(status_bit::TEST_FAILED),
            test_failed_this_operation_cycle: bit(status_bit::TEST_FAILED_THIS_OPERATION_CYCLE),
            pending_dtc: bit(status_bit::PENDING_DTC),
            confirmed_dtc: bit(status_bit::CONFIRMED_DTC),
            test_not_completed_since_last_clear: bit(
                status_bit::TEST_NOT_COMPLETED_SINCE_LAST_CLEAR,
            ),
            test_failed_since_last_clear: bit(status_bit::TEST_FAILED_SINCE_LAST_CLEAR),
            test_not_completed_this_operation_cycle: bit(
                status_bit::TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE,
            ),
            warning_indicator_requested: bit(status_bit::WARNING_INDICATOR_REQUESTED),
            raw: status,
        }
    }

    /// Test failed and confirmed
    pub fn is_active(&self) -> bool {
        self.test_failed && self.confirmed_dtc
    }

    pub fn matches_mask(&self, mask: u8) -> bool {
        (self.raw & mask) != 0
    }
}

/// One DTC record from a 0x19 response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcInfo {
    /// 24-bit DTC number (high, mid, low)
    pub dtc_number: u32,
    pub status: DtcStatus,
    pub snapshot_data: Vec<u8>,
    pub extended_data: Vec<u8>,
}

impl DtcInfo {
    pub fn new(dtc_number: u32, status: u8) -> Self {
        Self {
            dtc_number: dtc_number & 0x00FF_FFFF,
            status: DtcStatus::from_byte(status),
            snapshot_data: Vec::new(),
            extended_data: Vec::new(),
        }
    }

    /// The two bytes that carry the SAE code
    fn code_bits(&self) -> u16 {
        (self.dtc_number >> 8) as u16
    }

    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_raw(self.code_bits())
    }

    /// Standard DTC string, e.g. `P0101`
    pub fn code(&self) -> String {
        decode_dtc(self.code_bits())
    }

    /// Low byte of the DTC number
    pub fn failure_type(&self) -> u8 {
        (self.dtc_number & 0xFF) as u8
    }

    pub fn to_dtc(&self) -> Dtc {
        Dtc {
            code: self.code(),
            status_bits: self.status.raw,
            pending: self.status.pending_dtc,
            confirmed: self.status.confirmed_dtc,
            permanent: false,
        }
    }
}

/// Parse the records of a reportDTCByStatusMask response
///
/// `data` is the payload after the response SID:
/// `[subFunction, statusAvailabilityMask, {dtcHigh, dtcMid, dtcLow, status}*]`.
/// A trailing partial record is ignored.
pub fn parse_dtc_records(data: &[u8]) -> Vec<DtcInfo> {
    data.get(2..)
        .unwrap_or_default()
        .chunks_exact(4)
        .map(|chunk| {
            let number = u32::from_be_bytes([0, chunk[0], chunk[1], chunk[2]]);
            DtcInfo::new(number, chunk[3])
        })
        .collect()
}

/// Encode records the way an ECU answers reportDTCByStatusMask
pub fn encode_dtc_records(sub_function: u8, availability_mask: u8, dtcs: &[DtcInfo]) -> Vec<u8> {
    let mut data = Vec::with_capacity(2 + dtcs.len() * 4);
    data.push(sub_function);
    data.push(availability_mask);
    for dtc in dtcs {
        let bytes = dtc.dtc_number.to_be_bytes();
        data.extend_from_slice(&bytes[1..]);
        data.push(dtc.status.raw);
    }
    data
}

/// Which per-DTC record a 0x19 0x04 / 0x06 request reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DtcRecordKind {
    Snapshot,
    ExtendedData,
}

impl DtcRecordKind {
    pub fn sub_function(&self) -> u8 {
        match self {
            DtcRecordKind::Snapshot => sub_function::REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER,
            DtcRecordKind::ExtendedData => {
                sub_function::REPORT_DTC_EXTENDED_DATA_RECORD_BY_DTC_NUMBER
            }
        }
    }
}

/// Record number that requests every stored record
pub const ALL_RECORDS: u8 = 0xFF;

/// `[subFunction, dtcHigh, dtcMid, dtcLow, recordNumber]`
pub fn encode_record_request(kind: DtcRecordKind, dtc_number: u32, record: u8) -> Vec<u8> {
    let bytes = dtc_number.to_be_bytes();
    let mut data = vec![kind.sub_function()];
    data.extend_from_slice(&bytes[1..]);
    data.push(record);
    data
}

/// Parse a snapshot or extended data response
///
/// `data` is the payload after the response SID:
/// `[subFunction, dtcHigh, dtcMid, dtcLow, status, records..]`. The record
/// bytes are kept raw in `snapshot_data` or `extended_data`.
pub fn parse_record_response(kind: DtcRecordKind, data: &[u8]) -> Option<DtcInfo> {
    if data.len() < 5 || data[0] != kind.sub_function() {
        return None;
    }
    let number = u32::from_be_bytes([0, data[1], data[2], data[3]]);
    let mut info = DtcInfo::new(number, data[4]);
    let records = data[5..].to_vec();
    match kind {
        DtcRecordKind::Snapshot => info.snapshot_data = records,
        DtcRecordKind::ExtendedData => info.extended_data = records,
    }
    Some(info)
}

/// Encode a snapshot or extended data response for `dtc`
pub fn encode_record_response(kind: DtcRecordKind, dtc: &DtcInfo) -> Vec<u8> {
    let records = match kind {
        DtcRecordKind::Snapshot => &dtc.snapshot_data,
        DtcRecordKind::ExtendedData => &dtc.extended_data,
    };
    let bytes = dtc.dtc_number.to_be_bytes();
    let mut data = Vec::with_capacity(5 + records.len());
    data.push(kind.sub_function());
    data.extend_from_slice(&bytes[1..]);
    data.push(dtc.status.raw);
    data.extend_from_slice(records);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dtc_code_strings() {
        // P0101 = 0x00 0x65 0x00
        assert_eq!(DtcInfo::new(0x006500, 0).code(), "P0101");
        // C0420 = 0x41 0xA4 0x00
        let chassis = DtcInfo::new(0x41A400, 0);
        assert_eq!(chassis.code(), "C0420");
        assert_eq!(chassis.category(), DtcCategory::Chassis);
        // B1234 = 0x84 0xD2 0x00
        assert_eq!(DtcInfo::new(0x84D200, 0).code(), "B1234");
        // U0100 = 0xC0 0x64 0x00
        let network = DtcInfo::new(0xC06411, 0);
        assert_eq!(network.code(), "U0100");
        assert_eq!(network.failure_type(), 0x11);
    }

    #[test]
    fn test_dtc_status_parsing() {
        // Active fault: test_failed + confirmed_dtc = 0x09
        let status = DtcStatus::from_byte(0x09);
        assert!(status.test_failed);
        assert!(status.confirmed_dtc);
        assert!(!status.pending_dtc);
        assert!(status.is_active());
        assert!(status.matches_mask(status_bit::CONFIRMED_DTC));

        let pending = DtcStatus::from_byte(0x04);
        assert!(pending.pending_dtc);
        assert!(!pending.is_active());
    }

    #[test]
    fn test_parse_records() {
        let data = vec![
            0x02, 0xFF, // sub-function + status availability mask
            0x00, 0x65, 0x00, 0x09, // P0101 active
            0x41, 0xA4, 0x00, 0x04, // C0420 pending
            0x01, 0x02, // truncated
        ];
        let dtcs = parse_dtc_records(&data);
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].dtc_number, 0x006500);
        assert_eq!(dtcs[0].code(), "P0101");
        assert!(dtcs[0].status.is_active());
        assert_eq!(dtcs[1].code(), "C0420");

        let dtc = dtcs[1].to_dtc();
        assert!(dtc.pending);
        assert!(!dtc.confirmed);
        assert_eq!(dtc.status_bits, 0x04);
    }

    #[test]
    fn test_parse_records_short_payload() {
        assert!(parse_dtc_records(&[]).is_empty());
        assert!(parse_dtc_records(&[0x02, 0xFF]).is_empty());
    }

    #[test]
    fn test_encode_records_matches_parser() {
        let dtcs = vec![DtcInfo::new(0x030000, 0x08), DtcInfo::new(0xC10000, 0x2F)];
        let data = encode_dtc_records(sub_function::REPORT_DTC_BY_STATUS_MASK, 0xFF, &dtcs);
        assert_eq!(data.len(), 10);
        assert_eq!(parse_dtc_records(&data), dtcs);
    }

    #[test]
    fn test_record_request_layout() {
        assert_eq!(
            encode_record_request(DtcRecordKind::Snapshot, 0x00AB00, 0x01),
            vec![0x04, 0x00, 0xAB, 0x00, 0x01]
        );
        assert_eq!(
            encode_record_request(DtcRecordKind::ExtendedData, 0xC06411, ALL_RECORDS),
            vec![0x06, 0xC0, 0x64, 0x11, 0xFF]
        );
    }

    #[test]
    fn test_parse_snapshot_response() {
        let data = [0x04, 0x00, 0xAB, 0x00, 0x09, 0x01, 0x01, 0xF4, 0x0D, 0x32];
        let info = parse_record_response(DtcRecordKind::Snapshot, &data).unwrap();
        assert_eq!(info.code(), "P0171");
        assert!(info.status.is_active());
        assert_eq!(info.snapshot_data, vec![0x01, 0x01, 0xF4, 0x0D, 0x32]);
        assert!(info.extended_data.is_empty());

        // wrong sub-function echo or short header
        assert_eq!(parse_record_response(DtcRecordKind::ExtendedData, &data), None);
        assert_eq!(parse_record_response(DtcRecordKind::Snapshot, &data[..4]), None);
    }

    #[test]
    fn test_record_response_matches_parser() {
        let mut dtc = DtcInfo::new(0x012C00, 0x04);
        dtc.extended_data = vec![0x01, 0x03];
        let data = encode_record_response(DtcRecordKind::ExtendedData, &dtc);
        assert_eq!(data, vec![0x06, 0x01, 0x2C, 0x00, 0x04, 0x01, 0x03]);
        assert_eq!(
            parse_record_response(DtcRecordKind::ExtendedData, &data),
            Some(dtc)
        );
    }
}
