use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub walk: WalkOptions,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub copy: CopyOptions,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.copy.chunk_size == 0 {
            return Err(anyhow!("copy.chunk_size must be greater than zero"));
        }
        if self.walk.max_depth == 0 {
            return Err(anyhow!("walk.max_depth must be greater than zero"));
        }
        if self.health.assumed_frame_rate == 0 {
            return Err(anyhow!("health.assumed_frame_rate must be greater than zero"));
        }
        if self.health.max_index_bytes < 8 {
            return Err(anyhow!("health.max_index_bytes is too small to hold a box"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalkOptions {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub excludes: Vec<String>,
}

fn default_max_depth() -> usize {
    64
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            excludes: Vec::new(),
        }
    }
}

/// Structural thresholds used by the health checker and the remuxer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthPolicy {
    #[serde(default = "default_verify_png_crc")]
    pub verify_png_crc: bool,
    /// Largest `moov` the checker is willing to buffer.
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,
    #[serde(default = "default_max_nal_unit_bytes")]
    pub max_nal_unit_bytes: u64,
    /// Frame rate used when an index has to be rebuilt from a bare stream.
    #[serde(default = "default_assumed_frame_rate")]
    pub assumed_frame_rate: u32,
    #[serde(default = "default_max_box_depth")]
    pub max_box_depth: usize,
}

fn default_verify_png_crc() -> bool {
    true
}

fn default_max_index_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_max_nal_unit_bytes() -> u64 {
    32 * 1024 * 1024
}

fn default_assumed_frame_rate() -> u32 {
    30
}

fn default_max_box_depth() -> usize {
    16
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            verify_png_crc: default_verify_png_crc(),
            max_index_bytes: default_max_index_bytes(),
            max_nal_unit_bytes: default_max_nal_unit_bytes(),
            assumed_frame_rate: default_assumed_frame_rate(),
            max_box_depth: default_max_box_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CopyOptions {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub verify_digest: bool,
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            verify_digest: false,
        }
    }
}
