//! Firmware images and the UDS flash programming sequence
//!
//! [`FlashFile`] parses Intel HEX, Motorola S-Record and raw binary images
//! into address-tagged [`FlashBlock`]s. [`FlashManager`] writes them with
//! RequestDownload / TransferData / RequestTransferExit and reads them back
//! for verification.

mod block;
mod error;
mod file;
pub mod ihex;
mod manager;
mod region;
pub mod srec;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use block::{calculate_checksum, FlashBlock};
pub use error::{FlashError, FlashParseError};
pub use file::{FlashFile, ParsedImage};
pub use manager::{FlashManager, FlashProgress, FlashStatistics};
pub use region::{find_region_for_address, validate_address, FlashRegion};

/// Firmware container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashFileFormat {
    IntelHex,
    MotorolaSRecord,
    Binary,
    Elf,
    OdxF,
    Custom,
}

impl FlashFileFormat {
    /// Guess from the file extension; unknown extensions are binary
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "hex" | "ihex" => FlashFileFormat::IntelHex,
            "s19" | "s28" | "s37" | "srec" | "mot" => FlashFileFormat::MotorolaSRecord,
            "elf" => FlashFileFormat::Elf,
            "odx" | "odx-f" => FlashFileFormat::OdxF,
            _ => FlashFileFormat::Binary,
        }
    }

    /// Inverse of `Display`; unknown names map to `Custom`
    pub fn from_name(name: &str) -> Self {
        match name {
            "Intel HEX" => FlashFileFormat::IntelHex,
            "Motorola S-Record" => FlashFileFormat::MotorolaSRecord,
            "Binary" => FlashFileFormat::Binary,
            "ELF" => FlashFileFormat::Elf,
            "ODX-F" => FlashFileFormat::OdxF,
            _ => FlashFileFormat::Custom,
        }
    }
}

impl fmt::Display for FlashFileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlashFileFormat::IntelHex => "Intel HEX",
            FlashFileFormat::MotorolaSRecord => "Motorola S-Record",
            FlashFileFormat::Binary => "Binary",
            FlashFileFormat::Elf => "ELF",
            FlashFileFormat::OdxF => "ODX-F",
            FlashFileFormat::Custom => "Custom",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("fw.hex", FlashFileFormat::IntelHex)]
    #[case("FW.IHEX", FlashFileFormat::IntelHex)]
    #[case("fw.s19", FlashFileFormat::MotorolaSRecord)]
    #[case("fw.s37", FlashFileFormat::MotorolaSRecord)]
    #[case("fw.srec", FlashFileFormat::MotorolaSRecord)]
    #[case("fw.bin", FlashFileFormat::Binary)]
    #[case("fw", FlashFileFormat::Binary)]
    #[case("fw.elf", FlashFileFormat::Elf)]
    fn test_format_from_extension(#[case] path: &str, #[case] expected: FlashFileFormat) {
        assert_eq!(FlashFileFormat::from_path(Path::new(path)), expected);
    }

    #[test]
    fn test_format_names() {
        for format in [
            FlashFileFormat::IntelHex,
            FlashFileFormat::MotorolaSRecord,
            FlashFileFormat::Binary,
            FlashFileFormat::Elf,
            FlashFileFormat::OdxF,
            FlashFileFormat::Custom,
        ] {
            assert_eq!(FlashFileFormat::from_name(&format.to_string()), format);
        }
        assert_eq!(FlashFileFormat::from_name("zip"), FlashFileFormat::Custom);
    }
}
