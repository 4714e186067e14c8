use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub api_url: Option<String>,
    pub storage_url: Option<String>,
    pub blob_url: Option<String>,
    pub vcluster_url: Option<String>,
    pub token: Option<String>,
    pub username: Option<String>,
    pub cluster: Option<String>,
    pub org: Option<String>,
    pub project: Option<String>,

    // Tracing
    pub trace_id: Option<String>,
    pub trace_sampled: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
