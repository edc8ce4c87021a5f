//! Motorola S-Record reader
//!
//! Records are `S<type><count><address><data><checksum>`; the count covers
//! address, data and checksum, and the checksum is the ones' complement of
//! the byte sum of count, address and data. Every S1/S2/S3 record becomes
//! its own block.

use super::block::FlashBlock;
use super::error::FlashParseError;
use super::file::ParsedImage;

/// Address width in bytes for a record type, `None` for unknown types
fn address_len(record_type: char) -> Option<usize> {
    match record_type {
        '0' | '1' | '5' | '9' => Some(2),
        '2' | '6' | '8' => Some(3),
        '3' | '7' => Some(4),
        _ => None,
    }
}

pub fn parse(text: &str) -> Result<ParsedImage, FlashParseError> {
    if text.trim().is_empty() {
        return Err(FlashParseError::Empty);
    }

    let mut blocks = Vec::new();
    let mut header = None;
    let mut entry_point = None;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let rest = trimmed
            .strip_prefix('S')
            .ok_or(FlashParseError::MissingStartCode {
                line,
                expected: 'S',
            })?;
        let mut chars = rest.chars();
        let record_type = chars.next().ok_or(FlashParseError::Truncated { line })?;
        let addr_len =
            address_len(record_type).ok_or_else(|| FlashParseError::UnsupportedRecord {
                line,
                record_type: format!("S{}", record_type),
            })?;

        let bytes = hex::decode(chars.as_str()).map_err(|e| FlashParseError::from_hex(line, e))?;
        let Some((&count, body)) = bytes.split_first() else {
            return Err(FlashParseError::Truncated { line });
        };
        let count = count as usize;
        if body.len() < count {
            return Err(FlashParseError::Truncated { line });
        }
        if body.len() > count {
            return Err(FlashParseError::LengthMismatch {
                line,
                count,
                actual: body.len(),
            });
        }
        if count < addr_len + 1 {
            return Err(FlashParseError::Truncated { line });
        }

        let (payload, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = !payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if expected != checksum[0] {
            return Err(FlashParseError::ChecksumMismatch {
                line,
                expected,
                actual: checksum[0],
            });
        }

        let address = body[..addr_len]
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        let data = &body[addr_len..count - 1];

        match record_type {
            '0' => {
                let text: String = String::from_utf8_lossy(data)
                    .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                    .to_string();
                if !text.is_empty() {
                    header = Some(text);
                }
            }
            '1' | '2' | '3' => {
                if !data.is_empty() {
                    blocks.push(FlashBlock::new(address, data.to_vec()));
                }
            }
            '7' | '8' | '9' => entry_point = Some(address),
            // S5/S6 record counts
            _ => {}
        }
    }

    if blocks.is_empty() {
        return Err(FlashParseError::NoData);
    }
    Ok(ParsedImage {
        blocks,
        header,
        entry_point,
    })
}
