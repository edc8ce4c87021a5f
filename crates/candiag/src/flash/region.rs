use std::fmt;

use serde::{Deserialize, Serialize};

/// A named memory range of the target ECU
///
/// Addresses are inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRegion {
    pub name: String,
    pub start_address: u32,
    pub end_address: u32,
    /// Erase/program granularity
    #[serde(default = "default_region_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub protected: bool,
}

fn default_region_block_size() -> u32 {
    256
}

impl FlashRegion {
    pub fn new(name: impl Into<String>, start_address: u32, end_address: u32) -> Self {
        Self {
            name: name.into(),
            start_address,
            end_address,
            block_size: default_region_block_size(),
            protected: false,
        }
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Number of bytes covered; a region spanning the whole 32-bit space
    /// does not fit in `u32`
    pub fn size(&self) -> u64 {
        u64::from(self.end_address) - u64::from(self.start_address) + 1
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address <= self.end_address
    }

    /// Whether `[address, address + len)` lies completely inside
    pub fn contains_range(&self, address: u32, len: usize) -> bool {
        if len == 0 {
            return self.contains(address);
        }
        let last = u64::from(address) + len as u64 - 1;
        self.contains(address) && last <= u64::from(self.end_address)
    }
}

impl fmt::Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [0x{:08X}-0x{:08X}, {} bytes{}]",
            self.name,
            self.start_address,
            self.end_address,
            self.size(),
            if self.protected { ", protected" } else { "" }
        )
    }
}

/// Inside a configured, non-protected region
pub fn validate_address(address: u32, regions: &[FlashRegion]) -> bool {
    find_region_for_address(address, regions).is_some_and(|region| !region.protected)
}

/// First region containing `address`
pub fn find_region_for_address(address: u32, regions: &[FlashRegion]) -> Option<&FlashRegion> {
    regions.iter().find(|region| region.contains(address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Vec<FlashRegion> {
        vec![
            FlashRegion::new("boot", 0x0000, 0x7FFF).protected(),
            FlashRegion::new("application", 0x8000, 0xFFFF),
        ]
    }

    #[test]
    fn test_contains_is_inclusive() {
        let region = FlashRegion::new("app", 0x1000, 0x1FFF);
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1FFF));
        assert!(!region.contains(0x2000));
        assert!(!region.contains(0x0FFF));
        assert_eq!(region.size(), 0x1000);
        assert!(region.contains_range(0x1F00, 0x100));
        assert!(!region.contains_range(0x1F00, 0x101));
    }

    #[test]
    fn test_full_address_space_size() {
        assert_eq!(FlashRegion::new("all", 0, u32::MAX).size(), 1 << 32);
    }

    #[test]
    fn test_validate_address() {
        let regions = layout();
        assert!(!validate_address(0x0100, &regions));
        assert!(validate_address(0x8000, &regions));
        assert!(!validate_address(0x10000, &regions));
        assert_eq!(
            find_region_for_address(0x9000, &regions).map(|r| r.name.as_str()),
            Some("application")
        );
        assert_eq!(find_region_for_address(0x10000, &regions), None);
    }

    #[test]
    fn test_display() {
        let region = FlashRegion::new("boot", 0, 0xFF).protected();
        assert_eq!(
            region.to_string(),
            "boot [0x00000000-0x000000FF, 256 bytes, protected]"
        );
    }
}
