//! Configuration files and atomic writes
//!
//! Runtime settings and flow definitions live in JSON files. Writes go
//! through a temp file and a rename so a crash never leaves a half-written
//! file behind.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use super::RuntimeConfig;
use crate::flow::FlowDefinition;

/// Write data atomically to a file
///
/// Creates a temporary file, writes the data, syncs, then renames
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}

/// Write runtime configuration
pub fn write_config(path: &Path, config: &RuntimeConfig) -> Result<()> {
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, &json)
}

/// Load runtime configuration; missing fields take their defaults
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let data = fs::read(path).with_context(|| format!("Failed to read config: {:?}", path))?;
    let config = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to deserialize config: {:?}", path))?;
    Ok(config)
}

/// Load a JSON array of flow definitions
pub fn load_flow_definitions(path: &Path) -> Result<Vec<FlowDefinition>> {
    let data = fs::read(path).with_context(|| format!("Failed to read flows: {:?}", path))?;
    let flows = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to deserialize flows: {:?}", path))?;
    Ok(flows)
}
