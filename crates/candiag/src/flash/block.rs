use std::fmt;

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::Serialize;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC) used for block checksums
pub fn calculate_checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Contiguous bytes destined for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashBlock {
    pub address: u32,
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl FlashBlock {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        let checksum = calculate_checksum(&data);
        Self {
            address,
            data,
            checksum,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }

    /// Last byte's address, the start address for an empty block
    pub fn last_address(&self) -> u32 {
        (self.end().saturating_sub(1)).max(u64::from(self.address)) as u32
    }

    pub fn overlaps(&self, other: &FlashBlock) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        u64::from(self.address) < other.end() && u64::from(other.address) < self.end()
    }

    pub fn checksum_matches(&self) -> bool {
        calculate_checksum(&self.data) == self.checksum
    }
}

impl fmt::Display for FlashBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:08X} {} bytes crc32 {:08X}",
            self.address,
            self.data.len(),
            self.checksum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_crc32() {
        // Standard check value for "123456789"
        assert_eq!(calculate_checksum(b"123456789"), 0xCBF4_3926);
        let block = FlashBlock::new(0x100, b"123456789".to_vec());
        assert_eq!(block.checksum, 0xCBF4_3926);
        assert!(block.checksum_matches());
    }

    #[test]
    fn test_overlap() {
        let a = FlashBlock::new(0x00, vec![0; 16]);
        let b = FlashBlock::new(0x10, vec![0; 16]);
        let c = FlashBlock::new(0x0F, vec![0; 2]);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert_eq!(a.last_address(), 0x0F);
        assert_eq!(a.end(), 0x10);
    }

    #[test]
    fn test_block_at_top_of_address_space() {
        let block = FlashBlock::new(0xFFFF_FFFE, vec![1, 2]);
        assert_eq!(block.end(), 1 << 32);
        assert_eq!(block.last_address(), 0xFFFF_FFFF);
    }
}
