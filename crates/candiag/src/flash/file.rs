use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::{debug, info};

use super::block::FlashBlock;
use super::error::{FlashError, FlashParseError};
use super::region::FlashRegion;
use super::{ihex, srec, FlashFileFormat};

/// Output of a container parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImage {
    pub blocks: Vec<FlashBlock>,
    /// S0 header text
    pub header: Option<String>,
    /// Start address record (Intel HEX 03/05, S7/S8/S9)
    pub entry_point: Option<u32>,
}

/// A parsed firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFile {
    format: FlashFileFormat,
    blocks: Vec<FlashBlock>,
    metadata: BTreeMap<String, String>,
}

impl FlashFile {
    /// Build an image from blocks already in memory
    pub fn from_blocks(format: FlashFileFormat, blocks: Vec<FlashBlock>) -> Self {
        let mut file = Self {
            format,
            blocks,
            metadata: BTreeMap::new(),
        };
        file.fill_metadata();
        file
    }

    /// Read `path`, picking the format from its extension
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| FlashError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let format = FlashFileFormat::from_path(path);
        info!(path = %path.display(), %format, size = data.len(), "Loading flash file");

        let mut file = Self::parse(&data, format)?;
        file.metadata
            .insert("filename".to_string(), path.display().to_string());
        file.metadata
            .insert("size".to_string(), data.len().to_string());
        Ok(file)
    }

    /// Parse `data` as `format`
    pub fn parse(data: &[u8], format: FlashFileFormat) -> Result<Self, FlashError> {
        let image = match format {
            FlashFileFormat::IntelHex => ihex::parse(as_text(data)?)?,
            FlashFileFormat::MotorolaSRecord => srec::parse(as_text(data)?)?,
            FlashFileFormat::Binary => parse_binary(data)?,
            other => return Err(FlashError::UnsupportedFormat(other)),
        };

        let mut file = Self::from_blocks(format, image.blocks);
        if let Some(header) = image.header {
            file.metadata.insert("header".to_string(), header);
        }
        if let Some(entry) = image.entry_point {
            file.metadata
                .insert("entry_point".to_string(), format!("0x{:08X}", entry));
        }
        debug!(%file, "Flash file parsed");
        Ok(file)
    }

    fn fill_metadata(&mut self) {
        let (start, end) = self.address_range();
        self.metadata
            .insert("blocks".to_string(), self.blocks.len().to_string());
        self.metadata
            .insert("total_size".to_string(), self.total_size().to_string());
        self.metadata
            .insert("start_address".to_string(), format!("0x{:08X}", start));
        self.metadata
            .insert("end_address".to_string(), format!("0x{:08X}", end));
    }

    pub fn format(&self) -> FlashFileFormat {
        self.format
    }

    pub fn blocks(&self) -> &[FlashBlock] {
        &self.blocks
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Blocks whose start address lies in `region`
    pub fn blocks_for_region(&self, region: &FlashRegion) -> Vec<FlashBlock> {
        self.blocks
            .iter()
            .filter(|block| region.contains(block.address))
            .cloned()
            .collect()
    }

    pub fn total_size(&self) -> usize {
        self.blocks.iter().map(FlashBlock::len).sum()
    }

    /// Lowest start and highest last address, `(0, 0)` when empty
    pub fn address_range(&self) -> (u32, u32) {
        let start = self.blocks.iter().map(|b| b.address).min();
        let end = self.blocks.iter().map(FlashBlock::last_address).max();
        match (start, end) {
            (Some(start), Some(end)) => (start, end),
            _ => (0, 0),
        }
    }

    /// At least one block and no two blocks overlap
    pub fn validate(&self) -> bool {
        if self.blocks.is_empty() {
            return false;
        }
        self.blocks.iter().enumerate().all(|(i, a)| {
            self.blocks[i + 1..]
                .iter()
                .all(|b| !a.overlaps(b))
        })
    }
}

impl fmt::Display for FlashFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = self.address_range();
        write!(
            f,
            "{}: {} blocks, {} bytes, 0x{:08X}-0x{:08X}",
            self.format,
            self.blocks.len(),
            self.total_size(),
            start,
            end
        )
    }
}

fn as_text(data: &[u8]) -> Result<&str, FlashParseError> {
    std::str::from_utf8(data).map_err(|_| FlashParseError::NotText)
}

/// The whole input as one block at address 0
fn parse_binary(data: &[u8]) -> Result<ParsedImage, FlashParseError> {
    if data.is_empty() {
        return Err(FlashParseError::Empty);
    }
    Ok(ParsedImage {
        blocks: vec![FlashBlock::new(0, data.to_vec())],
        header: None,
        entry_point: None,
    })
}
