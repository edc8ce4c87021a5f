//! Intel HEX reader
//!
//! Record decoding and checksums come from the `ihex` crate; this module
//! applies the segment and linear base addresses and merges consecutive
//! data records at adjacent addresses into one block.

use super::block::FlashBlock;
use super::error::FlashParseError;
use super::file::ParsedImage;

/// Accumulates contiguous data into blocks
#[derive(Default)]
pub(crate) struct BlockBuilder {
    blocks: Vec<FlashBlock>,
    start: u32,
    data: Vec<u8>,
}

impl BlockBuilder {
    pub(crate) fn push(&mut self, address: u32, bytes: &[u8]) {
        let contiguous = !self.data.is_empty()
            && u64::from(address) == u64::from(self.start) + self.data.len() as u64;
        if !contiguous {
            self.flush();
            self.start = address;
        }
        self.data.extend_from_slice(bytes);
    }

    fn flush(&mut self) {
        if !self.data.is_empty() {
            let data = std::mem::take(&mut self.data);
            self.blocks.push(FlashBlock::new(self.start, data));
        }
    }

    pub(crate) fn finish(mut self) -> Vec<FlashBlock> {
        self.flush();
        self.blocks
    }
}

/// Map a record error from the `ihex` reader back onto `line`
fn record_error(line: usize, record: &str, err: ihex::ReaderError) -> FlashParseError {
    use ihex::ReaderError;

    match err {
        ReaderError::MissingStartCode => FlashParseError::MissingStartCode {
            line,
            expected: ':',
        },
        ReaderError::RecordTooShort | ReaderError::RecordNotEvenLength => {
            FlashParseError::Truncated { line }
        }
        ReaderError::ContainsInvalidCharacters => {
            let digits = record.get(1..).unwrap_or_default();
            match digits.chars().find(|c| !c.is_ascii_hexdigit()) {
                Some(character) => FlashParseError::InvalidHex { line, character },
                None => FlashParseError::Truncated { line },
            }
        }
        ReaderError::ChecksumMismatch(actual, expected) => FlashParseError::ChecksumMismatch {
            line,
            expected,
            actual,
        },
        ReaderError::PayloadLengthMismatch => {
            let count = record
                .get(1..3)
                .and_then(|digits| usize::from_str_radix(digits, 16).ok())
                .unwrap_or_default();
            // count, offset (2), type, checksum
            let actual = ((record.len() - 1) / 2).saturating_sub(5);
            if actual < count {
                FlashParseError::Truncated { line }
            } else {
                FlashParseError::LengthMismatch {
                    line,
                    count,
                    actual,
                }
            }
        }
        ReaderError::UnsupportedRecordType(record_type) => FlashParseError::UnsupportedRecord {
            line,
            record_type: format!("{:02X}", record_type),
        },
        other => FlashParseError::InvalidRecord {
            line,
            reason: other.to_string(),
        },
    }
}

pub fn parse(text: &str) -> Result<ParsedImage, FlashParseError> {
    if text.trim().is_empty() {
        return Err(FlashParseError::Empty);
    }

    // The reader yields one result per non-empty line; keep the source line
    // numbers alongside so errors point at the right place.
    let (lines, records): (Vec<usize>, Vec<&str>) = text
        .lines()
        .enumerate()
        .map(|(index, raw)| (index + 1, raw.trim()))
        .filter(|(_, record)| !record.is_empty())
        .unzip();
    let normalized = records.join("\n");

    let mut base: u32 = 0;
    let mut builder = BlockBuilder::default();
    let mut entry_point = None;

    let reader = ihex::Reader::new(&normalized);
    for ((line, record), parsed) in lines.iter().zip(&records).zip(reader) {
        let line = *line;
        match parsed.map_err(|e| record_error(line, record, e))? {
            ihex::Record::Data { offset, value } => {
                let address = base.checked_add(u32::from(offset)).ok_or_else(|| {
                    FlashParseError::InvalidRecord {
                        line,
                        reason: "address exceeds 32 bits".to_string(),
                    }
                })?;
                builder.push(address, &value);
            }
            ihex::Record::EndOfFile => break,
            ihex::Record::ExtendedSegmentAddress(segment) => {
                base = u32::from(segment) << 4;
            }
            ihex::Record::StartSegmentAddress { cs, ip } => {
                entry_point = Some((u32::from(cs) << 4).wrapping_add(u32::from(ip)));
            }
            ihex::Record::ExtendedLinearAddress(upper) => {
                base = u32::from(upper) << 16;
            }
            ihex::Record::StartLinearAddress(address) => {
                entry_point = Some(address);
            }
        }
    }

    let blocks = builder.finish();
    if blocks.is_empty() {
        return Err(FlashParseError::NoData);
    }
    Ok(ParsedImage {
        blocks,
        header: None,
        entry_point,
    })
}
