//! Diagnostic trouble codes shared by the UDS and OBD-II clients
//!
//! A raw DTC is 16 bits: bits 14-15 select the system letter and the low
//! 14 bits are the number, written as four zero-padded decimal digits.
//! `0x00AB` is `P0171`, `0xC064` is `U0100`.

use std::fmt;

use serde::Serialize;

const DTC_NUMBER_MASK: u16 = 0x3FFF;

/// DTC category based on the first character of the DTC code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    /// P codes - Powertrain (engine, transmission)
    Powertrain,
    /// C codes - Chassis (ABS, suspension)
    Chassis,
    /// B codes - Body (airbags, climate control)
    Body,
    /// U codes - Network (communication)
    Network,
}

impl DtcCategory {
    /// Category from the top two bits of a 16-bit DTC
    pub fn from_raw(raw: u16) -> Self {
        match (raw >> 14) & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix.to_ascii_uppercase() {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn bits(&self) -> u16 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }
}

impl fmt::Display for DtcCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DtcCategory::Powertrain => "powertrain",
            DtcCategory::Chassis => "chassis",
            DtcCategory::Body => "body",
            DtcCategory::Network => "network",
        };
        f.write_str(s)
    }
}

/// Render a raw 16-bit DTC as its code
///
/// Numbers above 9999 do not fit four digits and produce a six character
/// code that [`encode_dtc`] rejects.
pub fn decode_dtc(raw: u16) -> String {
    format!(
        "{}{:04}",
        DtcCategory::from_raw(raw).prefix(),
        raw & DTC_NUMBER_MASK
    )
}

/// Parse a five character code back to its raw value.
///
/// Returns `None` for anything that is not a letter from `PCBU` followed by
/// four decimal digits.
pub fn encode_dtc(code: &str) -> Option<u16> {
    let mut chars = code.chars();
    let category = DtcCategory::from_prefix(chars.next()?)?;
    let digits = chars.as_str();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let number = digits.parse::<u16>().ok()?;
    Some((category.bits() << 14) | (number & DTC_NUMBER_MASK))
}

/// A trouble code as reported by an ECU
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dtc {
    /// Five character code, e.g. `P0171`
    pub code: String,
    /// Raw status byte (UDS) or 0 (OBD-II)
    pub status_bits: u8,
    pub pending: bool,
    pub confirmed: bool,
    pub permanent: bool,
}

impl Dtc {
    pub fn from_raw(raw: u16) -> Self {
        Self {
            code: decode_dtc(raw),
            status_bits: 0,
            pending: false,
            confirmed: false,
            permanent: false,
        }
    }

    pub fn category(&self) -> Option<DtcCategory> {
        self.code.chars().next().and_then(DtcCategory::from_prefix)
    }

    pub fn raw(&self) -> Option<u16> {
        encode_dtc(&self.code)
    }

    /// Powertrain codes are emissions related
    pub fn is_emissions_related(&self) -> bool {
        self.category() == Some(DtcCategory::Powertrain)
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if self.pending {
            write!(f, " PENDING")?;
        }
        if self.confirmed {
            write!(f, " CONFIRMED")?;
        }
        if self.permanent {
            write!(f, " PERMANENT")?;
        }
        Ok(())
    }
}
