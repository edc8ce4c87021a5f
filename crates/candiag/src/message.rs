//! Diagnostic message shape shared by UDS and OBD-II

use std::fmt;

use thiserror::Error;

use crate::uds::NegativeResponseCode;

/// First payload byte of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Offset between a request service/mode and its positive response code
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Empty response payload")]
    Empty,

    #[error("Negative response too short: {0} bytes")]
    TruncatedNegative(usize),

    #[error("0x{0:02X} is not a response code")]
    NotAResponse(u8),
}

/// A request or response on either protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    /// Request service id / mode (never the response code)
    pub service: u8,
    /// Bytes after the service / response code
    pub data: Vec<u8>,
    pub is_response: bool,
    pub is_negative: bool,
    /// Present only on negative responses
    pub negative_code: Option<NegativeResponseCode>,
}

impl DiagnosticMessage {
    pub fn request(service: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            service,
            data: data.into(),
            is_response: false,
            is_negative: false,
            negative_code: None,
        }
    }

    /// Wire payload: `[service, data...]` for requests, the response code
    /// layout for responses
    pub fn to_payload(&self) -> Vec<u8> {
        if !self.is_response {
            let mut payload = Vec::with_capacity(self.data.len() + 1);
            payload.push(self.service);
            payload.extend_from_slice(&self.data);
            return payload;
        }
        match self.negative_code {
            Some(nrc) => vec![NEGATIVE_RESPONSE_SID, self.service, nrc.as_byte()],
            None => {
                let mut payload = vec![self.service.wrapping_add(POSITIVE_RESPONSE_OFFSET)];
                payload.extend_from_slice(&self.data);
                payload
            }
        }
    }

    /// Decode a received payload
    ///
    /// `[0x7F, sid, nrc, ..]` is negative, a first byte of 0x40 or above is
    /// positive for service `byte - 0x40`.
    pub fn from_response(payload: &[u8]) -> Result<Self, MessageError> {
        let (&code, rest) = payload.split_first().ok_or(MessageError::Empty)?;

        if code == NEGATIVE_RESPONSE_SID {
            if payload.len() < 3 {
                return Err(MessageError::TruncatedNegative(payload.len()));
            }
            return Ok(Self {
                service: payload[1],
                data: payload[3..].to_vec(),
                is_response: true,
                is_negative: true,
                negative_code: Some(NegativeResponseCode::from(payload[2])),
            });
        }

        if code < POSITIVE_RESPONSE_OFFSET {
            return Err(MessageError::NotAResponse(code));
        }

        Ok(Self {
            service: code - POSITIVE_RESPONSE_OFFSET,
            data: rest.to_vec(),
            is_response: true,
            is_negative: false,
            negative_code: None,
        })
    }

    pub fn is_positive(&self) -> bool {
        self.is_response && !self.is_negative
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        self.negative_code
    }
}

impl fmt::Display for DiagnosticMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_response, self.negative_code) {
            (false, _) => write!(f, "request 0x{:02X}", self.service)?,
            (true, None) => write!(f, "positive 0x{:02X}", self.service)?,
            (true, Some(nrc)) => {
                return write!(f, "negative 0x{:02X} {} (0x{:02X})", self.service, nrc, nrc)
            }
        }
        if !self.data.is_empty() {
            write!(f, " [{}]", hex::encode_upper(&self.data))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_payload() {
        let msg = DiagnosticMessage::request(0x22, vec![0xF1, 0x90]);
        assert_eq!(msg.to_payload(), vec![0x22, 0xF1, 0x90]);
        assert!(!msg.is_response);
        assert_eq!(msg.nrc(), None);
    }

    #[test]
    fn test_positive_response() {
        let msg = DiagnosticMessage::from_response(&[0x62, 0xF1, 0x90, 0x41]).unwrap();
        assert_eq!(msg.service, 0x22);
        assert_eq!(msg.data, vec![0xF1, 0x90, 0x41]);
        assert!(msg.is_positive());
        assert_eq!(msg.to_payload(), vec![0x62, 0xF1, 0x90, 0x41]);
    }

    #[test]
    fn test_negative_response() {
        let msg = DiagnosticMessage::from_response(&[0x7F, 0x27, 0x33]).unwrap();
        assert_eq!(msg.service, 0x27);
        assert!(msg.is_negative);
        assert_eq!(
            msg.negative_code,
            Some(NegativeResponseCode::SecurityAccessDenied)
        );
        assert_eq!(msg.to_payload(), vec![0x7F, 0x27, 0x33]);
        assert_eq!(
            msg.to_string(),
            "negative 0x27 SecurityAccessDenied (0x33)"
        );
    }

    #[test]
    fn test_malformed_responses() {
        assert_eq!(
            DiagnosticMessage::from_response(&[]),
            Err(MessageError::Empty)
        );
        assert_eq!(
            DiagnosticMessage::from_response(&[0x7F, 0x27]),
            Err(MessageError::TruncatedNegative(2))
        );
        assert_eq!(
            DiagnosticMessage::from_response(&[0x22, 0x01]),
            Err(MessageError::NotAResponse(0x22))
        );
    }
}
