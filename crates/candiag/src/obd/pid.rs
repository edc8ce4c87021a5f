//! Mode 01 parameter table and decode rules (SAE J1979)

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Parameter identifiers used by the named readers and decode rules
pub mod pid {
    pub const SUPPORTED_PIDS_01_20: u8 = 0x00;
    pub const MONITOR_STATUS: u8 = 0x01;
    pub const ENGINE_LOAD: u8 = 0x04;
    pub const COOLANT_TEMP: u8 = 0x05;
    pub const FUEL_PRESSURE: u8 = 0x0A;
    pub const INTAKE_MANIFOLD_PRESSURE: u8 = 0x0B;
    pub const ENGINE_RPM: u8 = 0x0C;
    pub const VEHICLE_SPEED: u8 = 0x0D;
    pub const TIMING_ADVANCE: u8 = 0x0E;
    pub const INTAKE_AIR_TEMP: u8 = 0x0F;
    pub const MAF_AIRFLOW_RATE: u8 = 0x10;
    pub const THROTTLE_POSITION: u8 = 0x11;
    pub const RUNTIME_SINCE_ENGINE_START: u8 = 0x1F;
    pub const SUPPORTED_PIDS_21_40: u8 = 0x20;
    pub const DISTANCE_WITH_MIL_ON: u8 = 0x21;
    pub const FUEL_TANK_LEVEL: u8 = 0x2F;
    pub const DISTANCE_SINCE_CODES_CLEARED: u8 = 0x31;
    pub const ABSOLUTE_BAROMETRIC_PRESSURE: u8 = 0x33;
    pub const SUPPORTED_PIDS_41_60: u8 = 0x40;
}

pub use self::pid::*;

/// Static description of one PID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PidInfo {
    pub pid: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub unit: &'static str,
}

const fn info(
    pid: u8,
    name: &'static str,
    description: &'static str,
    unit: &'static str,
) -> PidInfo {
    PidInfo {
        pid,
        name,
        description,
        unit,
    }
}

/// Mode 01 PIDs 0x00-0x40
pub const PID_TABLE: &[PidInfo] = &[
    info(0x00, "SUPPORTED_PIDS_01_20", "PIDs supported [01-20]", ""),
    info(0x01, "MONITOR_STATUS", "Monitor status since DTCs cleared", ""),
    info(0x02, "FREEZE_DTC", "Freeze DTC", ""),
    info(0x03, "FUEL_SYSTEM_STATUS", "Fuel system status", ""),
    info(0x04, "ENGINE_LOAD", "Engine Load", "%"),
    info(0x05, "COOLANT_TEMP", "Coolant Temperature", "°C"),
    info(0x06, "SHORT_TERM_FUEL_TRIM_1", "Short term fuel trim, bank 1", ""),
    info(0x07, "LONG_TERM_FUEL_TRIM_1", "Long term fuel trim, bank 1", ""),
    info(0x08, "SHORT_TERM_FUEL_TRIM_2", "Short term fuel trim, bank 2", ""),
    info(0x09, "LONG_TERM_FUEL_TRIM_2", "Long term fuel trim, bank 2", ""),
    info(0x0A, "FUEL_PRESSURE", "Fuel Pressure", "kPa"),
    info(0x0B, "INTAKE_MANIFOLD_PRESSURE", "Intake Manifold Pressure", "kPa"),
    info(0x0C, "ENGINE_RPM", "Engine RPM", "RPM"),
    info(0x0D, "VEHICLE_SPEED", "Vehicle Speed", "km/h"),
    info(0x0E, "TIMING_ADVANCE", "Timing Advance", "°"),
    info(0x0F, "INTAKE_AIR_TEMP", "Intake Air Temperature", "°C"),
    info(0x10, "MAF_AIRFLOW_RATE", "MAF Air Flow Rate", "g/s"),
    info(0x11, "THROTTLE_POSITION", "Throttle Position", "%"),
    info(0x12, "COMMANDED_SECONDARY_AIR_STATUS", "Commanded secondary air status", ""),
    info(0x13, "O2_SENSORS_PRESENT", "Oxygen sensors present", ""),
    info(0x14, "O2_SENSOR_1_VOLTAGE", "Oxygen sensor 1 voltage", ""),
    info(0x15, "O2_SENSOR_2_VOLTAGE", "Oxygen sensor 2 voltage", ""),
    info(0x16, "O2_SENSOR_3_VOLTAGE", "Oxygen sensor 3 voltage", ""),
    info(0x17, "O2_SENSOR_4_VOLTAGE", "Oxygen sensor 4 voltage", ""),
    info(0x18, "O2_SENSOR_5_VOLTAGE", "Oxygen sensor 5 voltage", ""),
    info(0x19, "O2_SENSOR_6_VOLTAGE", "Oxygen sensor 6 voltage", ""),
    info(0x1A, "O2_SENSOR_7_VOLTAGE", "Oxygen sensor 7 voltage", ""),
    info(0x1B, "O2_SENSOR_8_VOLTAGE", "Oxygen sensor 8 voltage", ""),
    info(0x1C, "OBD_STANDARDS", "OBD standards this vehicle conforms to", ""),
    info(0x1D, "O2_SENSORS_PRESENT_4_BANKS", "Oxygen sensors present (4 banks)", ""),
    info(0x1E, "AUXILIARY_INPUT_STATUS", "Auxiliary input status", ""),
    info(0x1F, "RUNTIME_SINCE_ENGINE_START", "Runtime Since Engine Start", "s"),
    info(0x20, "SUPPORTED_PIDS_21_40", "PIDs supported [21-40]", ""),
    info(0x21, "DISTANCE_WITH_MIL_ON", "Distance with MIL On", "km"),
    info(0x22, "FUEL_RAIL_PRESSURE", "Fuel rail pressure (relative to manifold vacuum)", ""),
    info(0x23, "FUEL_RAIL_GAUGE_PRESSURE", "Fuel rail gauge pressure", ""),
    info(0x24, "O2_SENSOR_1_FUEL_AIR_RATIO", "Oxygen sensor 1 fuel-air equivalence ratio", ""),
    info(0x25, "O2_SENSOR_2_FUEL_AIR_RATIO", "Oxygen sensor 2 fuel-air equivalence ratio", ""),
    info(0x26, "O2_SENSOR_3_FUEL_AIR_RATIO", "Oxygen sensor 3 fuel-air equivalence ratio", ""),
    info(0x27, "O2_SENSOR_4_FUEL_AIR_RATIO", "Oxygen sensor 4 fuel-air equivalence ratio", ""),
    info(0x28, "O2_SENSOR_5_FUEL_AIR_RATIO", "Oxygen sensor 5 fuel-air equivalence ratio", ""),
    info(0x29, "O2_SENSOR_6_FUEL_AIR_RATIO", "Oxygen sensor 6 fuel-air equivalence ratio", ""),
    info(0x2A, "O2_SENSOR_7_FUEL_AIR_RATIO", "Oxygen sensor 7 fuel-air equivalence ratio", ""),
    info(0x2B, "O2_SENSOR_8_FUEL_AIR_RATIO", "Oxygen sensor 8 fuel-air equivalence ratio", ""),
    info(0x2C, "COMMANDED_EGR", "Commanded EGR", ""),
    info(0x2D, "EGR_ERROR", "EGR error", ""),
    info(0x2E, "COMMANDED_EVAPORATIVE_PURGE", "Commanded evaporative purge", ""),
    info(0x2F, "FUEL_TANK_LEVEL", "Fuel Tank Level", "%"),
    info(0x30, "WARMUPS_SINCE_CODES_CLEARED", "Warm-ups since codes cleared", ""),
    info(0x31, "DISTANCE_SINCE_CODES_CLEARED", "Distance Since Codes Cleared", "km"),
    info(0x32, "EVAP_SYSTEM_VAPOR_PRESSURE", "Evap. system vapor pressure", ""),
    info(0x33, "ABSOLUTE_BAROMETRIC_PRESSURE", "Barometric Pressure", "kPa"),
    info(0x34, "O2_SENSOR_1_CURRENT", "Oxygen sensor 1 current", ""),
    info(0x35, "O2_SENSOR_2_CURRENT", "Oxygen sensor 2 current", ""),
    info(0x36, "O2_SENSOR_3_CURRENT", "Oxygen sensor 3 current", ""),
    info(0x37, "O2_SENSOR_4_CURRENT", "Oxygen sensor 4 current", ""),
    info(0x38, "O2_SENSOR_5_CURRENT", "Oxygen sensor 5 current", ""),
    info(0x39, "O2_SENSOR_6_CURRENT", "Oxygen sensor 6 current", ""),
    info(0x3A, "O2_SENSOR_7_CURRENT", "Oxygen sensor 7 current", ""),
    info(0x3B, "O2_SENSOR_8_CURRENT", "Oxygen sensor 8 current", ""),
    info(0x3C, "CATALYST_TEMP_BANK1_SENSOR1", "Catalyst temperature: bank 1, sensor 1", ""),
    info(0x3D, "CATALYST_TEMP_BANK2_SENSOR1", "Catalyst temperature: bank 2, sensor 1", ""),
    info(0x3E, "CATALYST_TEMP_BANK1_SENSOR2", "Catalyst temperature: bank 1, sensor 2", ""),
    info(0x3F, "CATALYST_TEMP_BANK2_SENSOR2", "Catalyst temperature: bank 2, sensor 2", ""),
    info(0x40, "SUPPORTED_PIDS_41_60", "PIDs supported [41-60]", ""),
];

/// Table entry for `pid`, if it is in the 0x00-0x40 range
pub fn pid_info(pid: u8) -> Option<&'static PidInfo> {
    PID_TABLE.get(pid as usize)
}

pub fn pid_description(pid: u8) -> &'static str {
    match pid_info(pid) {
        Some(info) if !info.unit.is_empty() => info.description,
        _ => "Unknown Parameter",
    }
}

/// `0x0c` style, as PIDs are usually written
pub fn pid_to_string(pid: u8) -> String {
    format!("0x{:02x}", pid)
}

/// Apply the decode rule for `pid` to the data bytes after the mode/PID echo
///
/// Returns `None` when fewer bytes are present than the rule needs.
pub fn decode_pid(pid: u8, data: &[u8]) -> Option<(f64, &'static str)> {
    let a = f64::from(*data.first()?);
    let ab = || data.get(1).map(|b| a * 256.0 + f64::from(*b));

    let decoded = match pid {
        pid::ENGINE_LOAD | pid::THROTTLE_POSITION | pid::FUEL_TANK_LEVEL => {
            (a * 100.0 / 255.0, "%")
        }
        pid::COOLANT_TEMP | pid::INTAKE_AIR_TEMP => (a - 40.0, "°C"),
        pid::ENGINE_RPM => (ab()? / 4.0, "RPM"),
        pid::VEHICLE_SPEED => (a, "km/h"),
        pid::FUEL_PRESSURE => (a * 3.0, "kPa"),
        pid::INTAKE_MANIFOLD_PRESSURE | pid::ABSOLUTE_BAROMETRIC_PRESSURE => (a, "kPa"),
        pid::TIMING_ADVANCE => (a / 2.0 - 64.0, "°"),
        pid::MAF_AIRFLOW_RATE => (ab()? / 100.0, "g/s"),
        pid::RUNTIME_SINCE_ENGINE_START => (ab()?, "s"),
        pid::DISTANCE_WITH_MIL_ON | pid::DISTANCE_SINCE_CODES_CLEARED => (ab()?, "km"),
        _ => (a, "raw"),
    };
    Some(decoded)
}

/// PIDs flagged in a 4-byte support bitmap starting after `base`
///
/// Bit `7 - bit` of byte `i` set means PID `base + i * 8 + bit + 1` is
/// supported. Anything but exactly 4 bytes yields nothing.
pub fn parse_supported_pids(bitmap: &[u8], base: u8) -> Vec<u8> {
    if bitmap.len() != 4 {
        return Vec::new();
    }
    let mut pids = Vec::new();
    for (i, byte) in bitmap.iter().enumerate() {
        for bit in 0..8u8 {
            if byte & (1 << (7 - bit)) != 0 {
                pids.push(base.wrapping_add(i as u8 * 8 + bit + 1));
            }
        }
    }
    pids
}

/// A decoded mode 01 (or freeze frame) value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub pid: u8,
    pub name: String,
    pub description: String,
    pub raw_data: Vec<u8>,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl Parameter {
    /// Decode `raw_data` (bytes after the mode/PID echo)
    pub fn decode(pid: u8, raw_data: &[u8]) -> Option<Self> {
        let (value, unit) = decode_pid(pid, raw_data)?;
        let name = pid_info(pid)
            .map(|info| info.name.to_string())
            .unwrap_or_else(|| pid_to_string(pid));
        Some(Self {
            pid,
            name,
            description: pid_description(pid).to_string(),
            raw_data: raw_data.to_vec(),
            value,
            unit: unit.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Value with two decimals and unit, e.g. `850.00 RPM`
    pub fn formatted_value(&self) -> String {
        if self.unit.is_empty() {
            format!("{:.2}", self.value)
        } else {
            format!("{:.2} {}", self.value, self.unit)
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.formatted_value())
    }
}
