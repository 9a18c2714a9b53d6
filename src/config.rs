//! Tuning configuration and registered-address file loading
//!
//! The address file seeds the contract registry at startup: one hex address
//! per line, with or without 0x prefix. Empty lines and lines starting with
//! '#' are ignored.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Knobs for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    /// Bound of the channel between the workers and the batch writer. A full
    /// channel backpressures the workers.
    pub block_processing_queue_size: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            block_processing_queue_size: 64,
        }
    }
}

/// Load contract addresses to register from a file.
pub fn load_address_file(path: &Path) -> Result<Vec<Address>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read address file {:?}", path))?;

    let mut addresses = Vec::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.strip_prefix("0x").unwrap_or(line).len() != 40 {
            anyhow::bail!("invalid address on line {}: {}", line_number + 1, line);
        }
        let address = crate::types::decode_hex_address(line)
            .with_context(|| format!("invalid address on line {}: {}", line_number + 1, line))?;
        addresses.push(address);
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_address_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "dAC17F958D2ee523a2206206994597C13D831ec7").unwrap();
        file.flush().unwrap();

        let addresses = load_address_file(file.path()).unwrap();
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn test_load_address_file_rejects_garbage() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not-an-address").unwrap();
        file.flush().unwrap();
        assert!(load_address_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_file_is_empty_registry() {
        let file = NamedTempFile::new().unwrap();
        assert!(load_address_file(file.path()).unwrap().is_empty());
    }

    #[test]
    fn test_default_tuning() {
        assert_eq!(TuningConfig::default().block_processing_queue_size, 64);
    }
}
