// src/output.rs
//
// Serialization of fetched pool records for the command line: a readable tree on the
// terminal, flat rows for JSON and CSV files.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::types::PoolRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl OutputFormat {
    /// `.json` and `.csv` map to their formats, anything else is text.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => OutputFormat::Json,
            Some("csv") => OutputFormat::Csv,
            _ => OutputFormat::Text,
        }
    }
}

/// One record flattened to a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolRow {
    pub pool_address: String,
    pub token0_address: String,
    pub token0_name: String,
    pub token0_symbol: String,
    pub token0_decimals: u8,
    pub token1_address: String,
    pub token1_name: String,
    pub token1_symbol: String,
    pub token1_decimals: u8,
}

impl From<&PoolRecord> for PoolRow {
    fn from(record: &PoolRecord) -> Self {
        Self {
            pool_address: format!("{:#x}", record.pool_address),
            token0_address: format!("{:#x}", record.token0.address),
            token0_name: record.token0.name.clone(),
            token0_symbol: record.token0.symbol.clone(),
            token0_decimals: record.token0.decimals,
            token1_address: format!("{:#x}", record.token1.address),
            token1_name: record.token1.name.clone(),
            token1_symbol: record.token1.symbol.clone(),
            token1_decimals: record.token1.decimals,
        }
    }
}

pub fn render(records: &[PoolRecord], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(records)),
        OutputFormat::Json => render_json(records),
        OutputFormat::Csv => render_csv(records),
    }
}

fn render_text(records: &[PoolRecord]) -> String {
    records
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn render_json(records: &[PoolRecord]) -> Result<String> {
    let rows: Vec<PoolRow> = records.iter().map(PoolRow::from).collect();
    serde_json::to_string_pretty(&rows).context("serializing records to JSON")
}

fn render_csv(records: &[PoolRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        writer.serialize(PoolRow::from(record))?;
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("flushing CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

/// Render `records` and write them to `path`, creating parent directories.
pub fn write_records(path: &Path, records: &[PoolRecord], format: OutputFormat) -> Result<()> {
    let body = render(records, format)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenMetadata;
    use ethers::types::Address;

    fn records() -> Vec<PoolRecord> {
        vec![
            PoolRecord::new(
                Address::from_low_u64_be(0xaa),
                TokenMetadata::new(Address::from_low_u64_be(1), "Wrapped Ether", "WETH", 18),
                TokenMetadata::new(Address::from_low_u64_be(2), "USD Coin", "USDC", 6),
            ),
            PoolRecord::unresolved(Address::from_low_u64_be(0xbb)),
        ]
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("out/pools.json")), OutputFormat::Json);
        assert_eq!(OutputFormat::from_path(Path::new("pools.CSV")), OutputFormat::Csv);
        assert_eq!(OutputFormat::from_path(Path::new("pools.txt")), OutputFormat::Text);
        assert_eq!(OutputFormat::from_path(Path::new("pools")), OutputFormat::Text);
    }

    #[test]
    fn test_json_rows_are_flat() {
        let json = render(&records(), OutputFormat::Json).unwrap();
        let rows: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(rows.as_array().unwrap().len(), 2);
        assert_eq!(rows[0]["token0_symbol"], "WETH");
        assert_eq!(rows[0]["token1_decimals"], 6);
        assert_eq!(
            rows[1]["token0_address"],
            "0x0000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_csv_has_header_and_one_line_per_record() {
        let csv = render(&records(), OutputFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("pool_address,token0_address,token0_name"));
        assert!(lines[1].contains("Wrapped Ether"));
    }

    #[test]
    fn test_write_records_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/pools.json");

        write_records(&path, &records(), OutputFormat::from_path(&path)).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("USD Coin"));
    }
}
