//! UDS services of the simulated ECU

use std::sync::atomic::Ordering;

use rand::Rng;
use tracing::{debug, info, warn};

use super::{read_byte, DownloadState, EcuState, SimulatedEcu, UploadState};
use crate::flash::calculate_checksum;
use crate::uds::dtc::{
    encode_dtc_records, encode_record_response, sub_function, DtcRecordKind, ALL_RECORDS,
};
use crate::uds::{
    dtc_group, routine_id, routine_sub_function, service_id, xor_key, NegativeResponseCode,
    SessionType,
};

type Nrc = NegativeResponseCode;

/// Availability mask reported with DTC records
const DTC_STATUS_AVAILABILITY_MASK: u8 = 0xFF;
/// Length format identifier: maxNumberOfBlockLength in 2 bytes
const LENGTH_FORMAT_IDENTIFIER: u8 = 0x20;

/// `[sid + 0x40, data..]`
pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(data.len() + 1);
    response.push(sid.wrapping_add(0x40));
    response.extend_from_slice(data);
    response
}

/// `[0x7F, sid, nrc]`
pub fn negative_response(sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, nrc.as_byte()]
}

fn be_value(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// `[addressAndLengthFormat, address.., size..]`
fn parse_address_and_length(data: &[u8]) -> Option<(u32, u32)> {
    let (&format, rest) = data.split_first()?;
    let size_len = (format >> 4) as usize;
    let addr_len = (format & 0x0F) as usize;
    if !(1..=4).contains(&addr_len) || !(1..=4).contains(&size_len) {
        return None;
    }
    let address = rest.get(..addr_len)?;
    let size = rest.get(addr_len..addr_len + size_len)?;
    Some((be_value(address), be_value(size)))
}

/// `[sid, dataFormat, addressAndLengthFormat, ..]` of 0x34/0x35
fn parse_memory_request(request: &[u8]) -> Option<(u32, u32)> {
    parse_address_and_length(request.get(2..)?)
}

impl SimulatedEcu {
    /// Answer one UDS request; an empty result means no response
    pub fn process_request(&self, request: &[u8]) -> Vec<u8> {
        let Some(&sid) = request.first() else {
            return Vec::new();
        };
        let mut state = self.state.lock();

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => {
                self.handle_session_control(&mut state, request)
            }
            service_id::TESTER_PRESENT => handle_tester_present(request),
            service_id::SECURITY_ACCESS => self.handle_security_access(&mut state, request),
            service_id::READ_DATA_BY_ID => handle_read_data_by_id(&state, request),
            service_id::WRITE_DATA_BY_ID => handle_write_data_by_id(&mut state, request),
            service_id::ECU_RESET => self.handle_ecu_reset(&mut state, request),
            service_id::READ_DTC_INFO => handle_read_dtc_info(&state, request),
            service_id::CLEAR_DIAGNOSTIC_INFO => handle_clear_dtc(&mut state, request),
            service_id::ROUTINE_CONTROL => self.handle_routine_control(&mut state, request),
            service_id::REQUEST_DOWNLOAD => self.handle_request_download(&mut state, request),
            service_id::REQUEST_UPLOAD => self.handle_request_upload(&mut state, request),
            service_id::TRANSFER_DATA => self.handle_transfer_data(&mut state, request),
            service_id::REQUEST_TRANSFER_EXIT => handle_request_transfer_exit(&mut state),
            _ => {
                debug!(service_id = sid, "Unsupported service");
                negative_response(sid, Nrc::ServiceNotSupported)
            }
        }
    }

    fn reset_session_state(&self, state: &mut EcuState) {
        state.security_unlocked = false;
        state.seed = None;
        state.download = None;
        state.upload = None;
        state.download_block = self.config.block_counter_start;
    }

    fn handle_session_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::DIAGNOSTIC_SESSION_CONTROL;
        let Some(&session) = request.get(1) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };
        if SessionType::from_byte(session).is_none() {
            debug!(session = format!("0x{:02X}", session), "Unsupported session type");
            return negative_response(sid, Nrc::SubFunctionNotSupported);
        }

        if session != state.session {
            // A session change relocks security and drops transfers
            self.reset_session_state(state);
            state.session = session;
        }
        info!(session = format!("0x{:02X}", session), "Session changed");
        // P2 = 25 ms, P2* = 500 * 10 ms
        positive_response(sid, &[session, 0x00, 0x19, 0x01, 0xF4])
    }

    fn handle_security_access(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::SECURITY_ACCESS;
        let Some(&sub_function) = request.get(1) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };

        if sub_function % 2 == 1 {
            // Already unlocked: a zero seed tells the tester no key is needed
            if state.security_unlocked {
                return positive_response(sid, &[sub_function, 0, 0, 0, 0]);
            }
            let mut rng = rand::thread_rng();
            let seed: Vec<u8> = (0..4).map(|_| rng.gen_range(1..=0xFF)).collect();
            debug!(seed = %hex::encode(&seed), "Security access: providing seed");
            let mut response = vec![sub_function];
            response.extend_from_slice(&seed);
            state.seed = Some(seed);
            return positive_response(sid, &response);
        }

        let Some(seed) = state.seed.take() else {
            return negative_response(sid, Nrc::RequestSequenceError);
        };
        let key = &request[2..];
        if key == xor_key(&seed, &self.config.security_secret).as_slice() {
            info!("Security access: key accepted");
            state.security_unlocked = true;
            positive_response(sid, &[sub_function])
        } else {
            warn!(received = %hex::encode(key), "Security access: invalid key");
            negative_response(sid, Nrc::InvalidKey)
        }
    }

    fn handle_ecu_reset(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::ECU_RESET;
        let Some(&reset_type) = request.get(1) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };
        if !(0x01..=0x05).contains(&reset_type) {
            return negative_response(sid, Nrc::SubFunctionNotSupported);
        }
        self.reset_session_state(state);
        state.session = SessionType::Default.as_byte();
        info!(reset_type, "ECU reset");
        positive_response(sid, &[reset_type])
    }

    fn handle_routine_control(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::ROUTINE_CONTROL;
        if request.len() < 4 {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        }
        let control = request[1];
        let routine = u16::from_be_bytes([request[2], request[3]]);
        let options = &request[4..];

        match (control, routine) {
            (routine_sub_function::START_ROUTINE, routine_id::ERASE_MEMORY) => {
                if state.session != SessionType::Programming.as_byte() {
                    return negative_response(sid, Nrc::ConditionsNotCorrect);
                }
                if !state.security_unlocked {
                    return negative_response(sid, Nrc::SecurityAccessDenied);
                }
                let Some((address, size)) = parse_address_and_length(options) else {
                    return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
                };
                let end = u64::from(address) + u64::from(size);
                state.memory.retain(|addr, _| {
                    let addr = u64::from(*addr);
                    addr < u64::from(address) || addr >= end
                });
                self.erase_count.fetch_add(1, Ordering::SeqCst);
                info!(address = format!("0x{:08X}", address), size, "Memory erased");
                positive_response(sid, &[control, request[2], request[3], 0x00])
            }
            (routine_sub_function::START_ROUTINE, routine_id::CHECK_PROGRAMMING_DEPENDENCIES) => {
                positive_response(sid, &[control, request[2], request[3], 0x00])
            }
            (0x01..=0x03, _) => negative_response(sid, Nrc::RequestOutOfRange),
            _ => negative_response(sid, Nrc::SubFunctionNotSupported),
        }
    }

    fn check_transfer_conditions(&self, state: &EcuState, sid: u8) -> Option<Vec<u8>> {
        if state.session != SessionType::Programming.as_byte() {
            debug!("Transfer denied: requires programming session");
            return Some(negative_response(sid, Nrc::ConditionsNotCorrect));
        }
        if !state.security_unlocked {
            debug!("Transfer denied: requires security access");
            return Some(negative_response(sid, Nrc::SecurityAccessDenied));
        }
        if state.download.is_some() || state.upload.is_some() {
            debug!("Transfer denied: transfer already in progress");
            return Some(negative_response(sid, Nrc::ConditionsNotCorrect));
        }
        None
    }

    fn block_length_response(&self, sid: u8) -> Vec<u8> {
        let max = self.config.max_block_length.min(u32::from(u16::MAX)) as u16;
        let [high, low] = max.to_be_bytes();
        positive_response(sid, &[LENGTH_FORMAT_IDENTIFIER, high, low])
    }

    fn handle_request_download(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::REQUEST_DOWNLOAD;
        if let Some(denied) = self.check_transfer_conditions(state, sid) {
            return denied;
        }
        let Some((address, total_size)) = parse_memory_request(request) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };
        if u64::from(address) + u64::from(total_size) > u64::from(u32::MAX) + 1 {
            return negative_response(sid, Nrc::RequestOutOfRange);
        }
        info!(
            address = format!("0x{:08X}", address),
            size = total_size,
            "RequestDownload: initiating download"
        );
        state.download = Some(DownloadState {
            address,
            total_size,
            received: 0,
        });
        self.block_length_response(sid)
    }

    fn handle_request_upload(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::REQUEST_UPLOAD;
        if let Some(denied) = self.check_transfer_conditions(state, sid) {
            return denied;
        }
        let Some((address, size)) = parse_memory_request(request) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };
        if u64::from(address) + u64::from(size) > u64::from(u32::MAX) + 1 {
            return negative_response(sid, Nrc::RequestOutOfRange);
        }
        let buffer = (0..size)
            .map(|i| read_byte(&state.memory, address.wrapping_add(i)))
            .collect();
        info!(
            address = format!("0x{:08X}", address),
            size,
            "RequestUpload: initiating upload"
        );
        state.upload = Some(UploadState {
            address,
            buffer,
            sent: 0,
            next_block: self.config.block_counter_start,
        });
        self.block_length_response(sid)
    }

    fn advance_counter(&self, counter: u8) -> u8 {
        match counter.wrapping_add(1) {
            0 if self.config.block_counter_wrap > 0 => self.config.block_counter_wrap,
            next => next,
        }
    }

    fn handle_transfer_data(&self, state: &mut EcuState, request: &[u8]) -> Vec<u8> {
        let sid = service_id::TRANSFER_DATA;
        let Some(&block) = request.get(1) else {
            return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
        };

        if let Some(upload) = state.upload.as_mut() {
            if block != upload.next_block {
                debug!(expected = upload.next_block, received = block, "Wrong upload block counter");
                return negative_response(sid, Nrc::WrongBlockSequenceCounter);
            }
            let max_data = (self.config.max_block_length as usize).saturating_sub(2).max(1);
            let end = (upload.sent + max_data).min(upload.buffer.len());
            let mut response = vec![block];
            response.extend_from_slice(&upload.buffer[upload.sent..end]);
            upload.sent = end;
            upload.next_block = self.advance_counter(upload.next_block);
            debug!(block, bytes = response.len() - 1, "TransferData upload: block sent");
            return positive_response(sid, &response);
        }

        let expected = state.download_block;
        let Some(download) = state.download.as_mut() else {
            debug!("TransferData denied: no active transfer");
            return negative_response(sid, Nrc::RequestSequenceError);
        };
        let data = &request[2..];
        if block != expected {
            debug!(expected, received = block, "Wrong download block counter");
            return negative_response(sid, Nrc::WrongBlockSequenceCounter);
        }
        if data.is_empty() || download.received as usize + data.len() > download.total_size as usize {
            return negative_response(sid, Nrc::TransferDataSuspended);
        }

        let fault = *self.write_fault.lock();
        let start = download.address.wrapping_add(download.received);
        download.received += data.len() as u32;
        for (i, byte) in data.iter().enumerate() {
            let address = start.wrapping_add(i as u32);
            let value = if fault == Some(address) { !*byte } else { *byte };
            state.memory.insert(address, value);
        }
        state.download_block = self.advance_counter(expected);
        debug!(block, bytes = data.len(), "TransferData download: block received");
        positive_response(sid, &[block])
    }
}

fn handle_tester_present(request: &[u8]) -> Vec<u8> {
    let sid = service_id::TESTER_PRESENT;
    let Some(&sub_function) = request.get(1) else {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    };
    if sub_function & 0x80 != 0 {
        return Vec::new();
    }
    positive_response(sid, &[sub_function])
}

fn handle_read_data_by_id(state: &EcuState, request: &[u8]) -> Vec<u8> {
    let sid = service_id::READ_DATA_BY_ID;
    if request.len() != 3 {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    }
    let did = u16::from_be_bytes([request[1], request[2]]);
    let value = match did {
        crate::uds::standard_did::ACTIVE_DIAGNOSTIC_SESSION => vec![state.session],
        _ => match state.dids.get(&did) {
            Some(value) => value.clone(),
            None => return negative_response(sid, Nrc::RequestOutOfRange),
        },
    };
    let mut response = request[1..3].to_vec();
    response.extend_from_slice(&value);
    positive_response(sid, &response)
}

fn handle_write_data_by_id(state: &mut EcuState, request: &[u8]) -> Vec<u8> {
    let sid = service_id::WRITE_DATA_BY_ID;
    if request.len() < 4 {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    }
    let did = u16::from_be_bytes([request[1], request[2]]);
    if !state.dids.contains_key(&did) {
        return negative_response(sid, Nrc::RequestOutOfRange);
    }
    if !state.security_unlocked {
        return negative_response(sid, Nrc::SecurityAccessDenied);
    }
    state.dids.insert(did, request[3..].to_vec());
    info!(did = format!("0x{:04X}", did), "DID written");
    positive_response(sid, &request[1..3])
}

fn handle_read_dtc_info(state: &EcuState, request: &[u8]) -> Vec<u8> {
    let sid = service_id::READ_DTC_INFO;
    let Some(&report) = request.get(1) else {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    };
    match report {
        sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK => {
            let mask = request.get(2).copied().unwrap_or_default();
            let count = state
                .dtcs
                .iter()
                .filter(|dtc| dtc.status.matches_mask(mask))
                .count() as u16;
            let [high, low] = count.to_be_bytes();
            // Format identifier 0x01: ISO 14229-1 DTC format
            positive_response(sid, &[report, DTC_STATUS_AVAILABILITY_MASK, 0x01, high, low])
        }
        sub_function::REPORT_DTC_BY_STATUS_MASK => {
            let Some(&mask) = request.get(2) else {
                return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
            };
            let matching: Vec<_> = state
                .dtcs
                .iter()
                .filter(|dtc| dtc.status.matches_mask(mask))
                .cloned()
                .collect();
            positive_response(
                sid,
                &encode_dtc_records(report, DTC_STATUS_AVAILABILITY_MASK, &matching),
            )
        }
        sub_function::REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER => {
            dtc_record(state, request, DtcRecordKind::Snapshot)
        }
        sub_function::REPORT_DTC_EXTENDED_DATA_RECORD_BY_DTC_NUMBER => {
            dtc_record(state, request, DtcRecordKind::ExtendedData)
        }
        sub_function::REPORT_SUPPORTED_DTC => positive_response(
            sid,
            &encode_dtc_records(report, DTC_STATUS_AVAILABILITY_MASK, &state.dtcs),
        ),
        _ => negative_response(sid, Nrc::SubFunctionNotSupported),
    }
}

/// `[0x19, sub, dtcHigh, dtcMid, dtcLow, record]`; every stored DTC keeps
/// record 1 only
fn dtc_record(state: &EcuState, request: &[u8], kind: DtcRecordKind) -> Vec<u8> {
    let sid = service_id::READ_DTC_INFO;
    if request.len() != 6 {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    }
    let number = be_value(&request[2..5]);
    let record = request[5];
    let Some(dtc) = state.dtcs.iter().find(|dtc| dtc.dtc_number == number) else {
        debug!(dtc = format!("0x{:06X}", number), "Unknown DTC");
        return negative_response(sid, Nrc::RequestOutOfRange);
    };
    if record != 0x01 && record != ALL_RECORDS {
        return negative_response(sid, Nrc::RequestOutOfRange);
    }
    positive_response(sid, &encode_record_response(kind, dtc))
}

fn handle_clear_dtc(state: &mut EcuState, request: &[u8]) -> Vec<u8> {
    let sid = service_id::CLEAR_DIAGNOSTIC_INFO;
    if request.len() != 4 {
        return negative_response(sid, Nrc::IncorrectMessageLengthOrFormat);
    }
    let group = be_value(&request[1..4]);
    let before = state.dtcs.len();
    if group == dtc_group::ALL {
        state.dtcs.clear();
    } else {
        state.dtcs.retain(|dtc| dtc.dtc_number != group);
    }
    info!(
        group = format!("0x{:06X}", group),
        cleared = before - state.dtcs.len(),
        "DTCs cleared"
    );
    positive_response(sid, &[])
}

fn handle_request_transfer_exit(state: &mut EcuState) -> Vec<u8> {
    let sid = service_id::REQUEST_TRANSFER_EXIT;
    if let Some(upload) = state.upload.take() {
        let crc = calculate_checksum(&upload.buffer);
        info!(
            address = format!("0x{:08X}", upload.address),
            bytes = upload.sent,
            crc32 = format!("0x{:08X}", crc),
            "RequestTransferExit upload: transfer completed"
        );
        return positive_response(sid, &crc.to_be_bytes());
    }
    match state.download.take() {
        Some(download) if download.received == download.total_size => {
            info!(
                address = format!("0x{:08X}", download.address),
                bytes = download.received,
                "RequestTransferExit download: transfer completed"
            );
            positive_response(sid, &[])
        }
        Some(download) => {
            warn!(
                received = download.received,
                expected = download.total_size,
                "RequestTransferExit before all data arrived"
            );
            negative_response(sid, Nrc::GeneralProgrammingFailure)
        }
        None => negative_response(sid, Nrc::RequestSequenceError),
    }
}
