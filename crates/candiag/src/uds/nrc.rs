//! UDS Negative Response Codes (NRC)

use std::fmt;

use serde::{Serialize, Serializer};

macro_rules! negative_response_codes {
    ($( $(#[$meta:meta])* $name:ident = $value:literal => $text:literal, )*) => {
        /// UDS Negative Response Codes (ISO 14229-1 Annex A)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NegativeResponseCode {
            $( $(#[$meta])* $name, )*
            /// Unknown/reserved NRC
            Unknown(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $( $value => Self::$name, )*
                    other => Self::Unknown(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $( NegativeResponseCode::$name => $value, )*
                    NegativeResponseCode::Unknown(v) => v,
                }
            }
        }

        impl NegativeResponseCode {
            /// Human readable description
            pub fn description(&self) -> &'static str {
                match self {
                    $( Self::$name => $text, )*
                    Self::Unknown(_) => "Unknown negative response",
                }
            }

            fn name(&self) -> Option<&'static str> {
                match self {
                    $( Self::$name => Some(stringify!($name)), )*
                    Self::Unknown(_) => None,
                }
            }
        }
    };
}

negative_response_codes! {
    GeneralReject = 0x10 => "General reject",
    ServiceNotSupported = 0x11 => "Service not supported",
    SubFunctionNotSupported = 0x12 => "Sub-function not supported",
    IncorrectMessageLengthOrFormat = 0x13 => "Incorrect message length or invalid format",
    ResponseTooLong = 0x14 => "Response too long",
    BusyRepeatRequest = 0x21 => "Busy, repeat request",
    ConditionsNotCorrect = 0x22 => "Conditions not correct",
    RequestSequenceError = 0x24 => "Request sequence error",
    NoResponseFromSubnet = 0x25 => "No response from sub-net component",
    FailurePreventsExecution = 0x26 => "Failure prevents execution of requested action",
    RequestOutOfRange = 0x31 => "Request out of range",
    SecurityAccessDenied = 0x33 => "Security access denied",
    InvalidKey = 0x35 => "Invalid key",
    ExceededNumberOfAttempts = 0x36 => "Exceeded number of attempts",
    RequiredTimeDelayNotExpired = 0x37 => "Required time delay not expired",
    UploadDownloadNotAccepted = 0x70 => "Upload/download not accepted",
    TransferDataSuspended = 0x71 => "Transfer data suspended",
    GeneralProgrammingFailure = 0x72 => "General programming failure",
    WrongBlockSequenceCounter = 0x73 => "Wrong block sequence counter",
    /// Request received, final response follows within P2*
    ResponsePending = 0x78 => "Request correctly received, response pending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "Sub-function not supported in active session",
    ServiceNotSupportedInActiveSession = 0x7F => "Service not supported in active session",
    RpmTooHigh = 0x81 => "RPM too high",
    RpmTooLow = 0x82 => "RPM too low",
    EngineRunning = 0x83 => "Engine is running",
    EngineNotRunning = 0x84 => "Engine is not running",
    EngineRunTimeTooLow = 0x85 => "Engine run time too low",
    TemperatureTooHigh = 0x86 => "Temperature too high",
    TemperatureTooLow = 0x87 => "Temperature too low",
    VehicleSpeedTooHigh = 0x88 => "Vehicle speed too high",
    VehicleSpeedTooLow = 0x89 => "Vehicle speed too low",
    ThrottleTooHigh = 0x8A => "Throttle/pedal too high",
    ThrottleTooLow = 0x8B => "Throttle/pedal too low",
    TransmissionNotInNeutral = 0x8C => "Transmission range not in neutral",
    TransmissionNotInGear = 0x8D => "Transmission range not in gear",
    BrakeSwitchNotClosed = 0x8F => "Brake switch not closed",
    ShifterNotInPark = 0x90 => "Shifter lever not in park",
    TorqueConverterClutchLocked = 0x91 => "Torque converter clutch locked",
    VoltageTooHigh = 0x92 => "Voltage too high",
    VoltageTooLow = 0x93 => "Voltage too low",
}

impl NegativeResponseCode {
    pub fn as_byte(&self) -> u8 {
        (*self).into()
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.as_byte(), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Unknown(0x{:02X})", self.as_byte()),
        }
    }
}

impl Serialize for NegativeResponseCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_byte())
    }
}
