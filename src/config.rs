//! Configuration types for pcapmap

use serde::{Deserialize, Serialize};

use crate::registry::MMAP_ENGINE;
use crate::storage::{
    InitialCapacity, StorageOptions, DEFAULT_SNAPSHOT_LEN, FILE_HEADER_SIZE, LINKTYPE_EN10MB,
};
use crate::{PcapMapError, Result};

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage engine identifier
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Snapshot length written into new files
    #[serde(default = "default_snapshot_len")]
    pub snapshot_len: u32,
    /// Link-layer type written into new files
    #[serde(default = "default_link_type")]
    pub link_type: u32,
    /// Size the initial reservation for jumbo frames
    #[serde(default)]
    pub jumbo_frames: bool,
    /// Explicit initial reservation in bytes, overriding `jumbo_frames`
    #[serde(default)]
    pub initial_capacity: Option<usize>,
    /// Pin read mappings resident
    #[serde(default)]
    pub lock_pages: bool,
}

fn default_engine() -> String {
    MMAP_ENGINE.to_string()
}

fn default_snapshot_len() -> u32 {
    DEFAULT_SNAPSHOT_LEN
}

fn default_link_type() -> u32 {
    LINKTYPE_EN10MB
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            snapshot_len: default_snapshot_len(),
            link_type: default_link_type(),
            jumbo_frames: false,
            initial_capacity: None,
            lock_pages: false,
        }
    }
}

impl StorageConfig {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PcapMapError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| PcapMapError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if self.engine.is_empty() {
            return Err(PcapMapError::ConfigError(
                "engine cannot be empty".to_string(),
            ));
        }

        if self.snapshot_len == 0 {
            return Err(PcapMapError::ConfigError(
                "snapshot_len must be > 0".to_string(),
            ));
        }

        if let Some(capacity) = self.initial_capacity {
            if capacity <= FILE_HEADER_SIZE {
                return Err(PcapMapError::ConfigError(format!(
                    "initial_capacity must exceed the {FILE_HEADER_SIZE} byte file header, got {capacity}"
                )));
            }
        }

        Ok(())
    }

    /// Initial reservation selected by this configuration
    #[must_use]
    pub fn initial_capacity(&self) -> InitialCapacity {
        match (self.initial_capacity, self.jumbo_frames) {
            (Some(bytes), _) => InitialCapacity::Exact(bytes),
            (None, true) => InitialCapacity::Jumbo,
            (None, false) => InitialCapacity::Standard,
        }
    }

    /// Engine options derived from this configuration
    #[must_use]
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            linktype: self.link_type,
            snaplen: self.snapshot_len,
            initial_capacity: self.initial_capacity(),
            lock_pages: self.lock_pages,
        }
    }
}
