//! CAN frame model and identifier helpers

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use super::TransportError;

/// Highest identifier representable in an 11-bit (standard) frame
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Highest identifier representable in a 29-bit (extended) frame
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Payload limit of a classic CAN data frame
pub const MAX_CLASSIC_PAYLOAD: usize = 8;
/// Payload limit of a segmented ISO 15765-2 message
pub const MAX_SEGMENTED_PAYLOAD: usize = 4095;

/// Bit rates accepted by common CAN controllers
pub const STANDARD_BITRATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// A single frame seen on (or handed to) the CAN channel
///
/// Frames are value objects: clients build one per request and the transport
/// delivers a fresh copy of every received frame to each subscriber.
#[derive(Debug, Clone)]
pub struct CanFrame {
    /// Arbitration identifier (11 or 29 bit)
    pub id: u32,
    /// Data bytes
    pub payload: Bytes,
    /// 29-bit identifier
    pub extended: bool,
    /// Remote transmission request
    pub remote_request: bool,
    /// When the frame was created or received
    pub timestamp: Instant,
}

impl CanFrame {
    /// Create a standard (11-bit) data frame
    pub fn new(id: u32, payload: &[u8]) -> Self {
        Self::with_id_type(id, false, payload)
    }

    /// Create an extended (29-bit) data frame
    pub fn new_extended(id: u32, payload: &[u8]) -> Self {
        Self::with_id_type(id, true, payload)
    }

    pub fn with_id_type(id: u32, extended: bool, payload: &[u8]) -> Self {
        Self::from_bytes(id, extended, Bytes::copy_from_slice(payload))
    }

    /// Create a frame around an already shared buffer
    pub fn from_bytes(id: u32, extended: bool, payload: Bytes) -> Self {
        Self {
            id,
            payload,
            extended,
            remote_request: false,
            timestamp: Instant::now(),
        }
    }

    /// Create a remote transmission request for `id`
    pub fn remote(id: u32, extended: bool) -> Self {
        Self {
            remote_request: true,
            ..Self::from_bytes(id, extended, Bytes::new())
        }
    }

    /// Classic CAN validity: identifier in range and at most 8 data bytes
    pub fn is_valid(&self) -> bool {
        self.has_valid_id() && self.payload.len() <= MAX_CLASSIC_PAYLOAD
    }

    pub fn has_valid_id(&self) -> bool {
        is_valid_can_id(self.id, self.extended)
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// First payload byte, the response code for diagnostic traffic
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

// Timestamps differ between otherwise identical frames, so equality only
// covers what travels on the wire.
impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.extended == other.extended
            && self.remote_request == other.remote_request
            && self.payload == other.payload
    }
}

impl Eq for CanFrame {}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]",
            can_id_to_string(self.id, self.extended),
            self.payload.len()
        )?;
        if self.remote_request {
            return write!(f, " RTR");
        }
        for byte in self.payload.iter() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Check an identifier against the 11-bit or 29-bit range
pub fn is_valid_can_id(id: u32, extended: bool) -> bool {
    if extended {
        id <= MAX_EXTENDED_ID
    } else {
        id <= MAX_STANDARD_ID
    }
}

/// Format an identifier as `0x7E0` (standard) or `0x18DA00F1` (extended)
pub fn can_id_to_string(id: u32, extended: bool) -> String {
    if extended {
        format!("0x{:08X}", id)
    } else {
        format!("0x{:03X}", id)
    }
}

/// Parse a hexadecimal CAN identifier, with or without a `0x` prefix
pub fn parse_can_id(s: &str) -> Result<u32, TransportError> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    let id = u32::from_str_radix(digits, 16)
        .map_err(|e| TransportError::InvalidConfig(format!("Invalid CAN ID '{}': {}", s, e)))?;

    if id > MAX_EXTENDED_ID {
        return Err(TransportError::InvalidConfig(format!(
            "CAN ID '{}' exceeds 29 bits",
            s
        )));
    }
    Ok(id)
}

pub fn is_standard_bitrate(bitrate: u32) -> bool {
    STANDARD_BITRATES.contains(&bitrate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x000, false, true)]
    #[case(0x7FF, false, true)]
    #[case(0x800, false, false)]
    #[case(0x7FF, true, true)]
    #[case(0x1FFF_FFFF, true, true)]
    #[case(0x2000_0000, true, false)]
    fn test_can_id_range(#[case] id: u32, #[case] extended: bool, #[case] valid: bool) {
        assert_eq!(is_valid_can_id(id, extended), valid);
    }

    #[test]
    fn test_frame_validity() {
        assert!(CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]).is_valid());
        assert!(!CanFrame::new(0x7E0, &[0u8; 9]).is_valid());
        assert!(!CanFrame::new(0x800, &[0x00]).is_valid());
        assert!(CanFrame::new_extended(0x18DA_00F1, &[0x3E, 0x00]).is_valid());
    }

    #[test]
    fn test_frame_equality_ignores_timestamp() {
        let a = CanFrame::new(0x123, &[1, 2, 3]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = CanFrame::new(0x123, &[1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, CanFrame::new_extended(0x123, &[1, 2, 3]));
    }

    #[test]
    fn test_can_id_formatting() {
        assert_eq!(can_id_to_string(0x7E0, false), "0x7E0");
        assert_eq!(can_id_to_string(0x18DA_00F1, true), "0x18DA00F1");
        assert_eq!(
            CanFrame::new(0x7E8, &[0x62, 0xF1, 0x90]).to_string(),
            "0x7E8 [3] 62 F1 90"
        );
        assert_eq!(CanFrame::remote(0x100, false).to_string(), "0x100 [0] RTR");
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_can_id("7e8").unwrap(), 0x7E8);
        assert_eq!(parse_can_id(" 0X18DA00F1 ").unwrap(), 0x18DA_00F1);
        assert!(parse_can_id("0xZZ").is_err());
        assert!(parse_can_id("0x20000000").is_err());
    }

    #[test]
    fn test_standard_bitrates() {
        assert!(is_standard_bitrate(500_000));
        assert!(!is_standard_bitrate(333_333));
    }
}
