//! Coordinator configuration file

use anyhow::{Context, Result};
use match_coordinator::CoordinatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Optional JSON file; anything missing takes its default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Read and confirmation commitment level
    pub commitment: String,
    #[serde(flatten)]
    pub coordinator: CoordinatorConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            commitment: "confirmed".to_string(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

pub fn load(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: FileConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    config.coordinator.validate()?;
    Ok(config)
}
