//! Inspect command - firmware image summary

use std::path::Path;

use anyhow::{Context, Result};
use candiag::FlashFile;

use crate::output::{BlockRow, OutputContext, OutputFormat};

pub fn inspect(path: &Path, ctx: &OutputContext) -> Result<()> {
    let file = FlashFile::load_from_file(path)
        .with_context(|| format!("Failed to parse firmware file: {}", path.display()))?;
    let (start, end) = file.address_range();

    let mut summary = vec![
        ("file", path.display().to_string()),
        ("format", file.format().to_string()),
        ("blocks", file.blocks().len().to_string()),
        ("size", file.total_size().to_string()),
        ("range", format!("0x{:08X}-0x{:08X}", start, end)),
        ("valid", file.validate().to_string()),
    ];
    summary.extend(
        file.metadata()
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone())),
    );

    let rows: Vec<BlockRow> = file
        .blocks()
        .iter()
        .enumerate()
        .map(|(index, block)| BlockRow {
            index,
            start: format!("0x{:08X}", block.address),
            end: format!("0x{:08X}", block.last_address()),
            size: block.len(),
            checksum: format!("{:08X}", block.checksum),
        })
        .collect();

    // One JSON document instead of two
    if ctx.format == OutputFormat::Json {
        let mut document = serde_json::Map::new();
        for (key, value) in &summary {
            document.insert(key.to_string(), serde_json::Value::String(value.clone()));
        }
        document.insert("block_list".to_string(), serde_json::to_value(&rows)?);
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    ctx.print_kv(&summary);
    ctx.heading("Blocks");
    ctx.print(&rows);
    Ok(())
}
