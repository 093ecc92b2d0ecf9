use crate::compression::CompressionLevel;
use crate::data_view::{DataViewManagerConfig, DEFAULT_SUB_FETCH_SIZE};
use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tuning knobs for a volume data store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VdsConfig {
    /// Maximum number of pages an accessor keeps resident
    pub max_pages: usize,

    /// Byte budget for prefetched, not yet consumed views
    pub prefetch_limit_bytes: u64,

    /// Largest single range request issued for one view
    pub sub_fetch_size: u64,

    /// Worker threads of the I/O runtime
    pub io_threads: usize,

    /// How long page allocation may block without progress
    pub page_wait_timeout_ms: u64,

    /// Compression level used when encoding chunks (0-9)
    pub compression_level: u8,
}

impl Default for VdsConfig {
    fn default() -> Self {
        Self {
            max_pages: 8,
            prefetch_limit_bytes: 256 * 1024 * 1024, // 256MB
            sub_fetch_size: DEFAULT_SUB_FETCH_SIZE,
            io_threads: 4,
            page_wait_timeout_ms: 30_000,
            compression_level: 6,
        }
    }
}

impl VdsConfig {
    /// Load a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: VdsConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_pages", self.max_pages as u64),
            ("prefetch_limit_bytes", self.prefetch_limit_bytes),
            ("sub_fetch_size", self.sub_fetch_size),
            ("io_threads", self.io_threads as u64),
            ("page_wait_timeout_ms", self.page_wait_timeout_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);
        if let Some((name, _)) = zero {
            return Err(VdsError::Configuration(format!("{} must be greater than zero", name)));
        }
        if self.compression_level > 9 {
            return Err(VdsError::Configuration(format!(
                "compression_level {} is outside 0-9",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn page_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.page_wait_timeout_ms)
    }

    pub fn compression_level(&self) -> CompressionLevel {
        CompressionLevel::new(self.compression_level)
    }

    pub fn view_manager_config(&self) -> DataViewManagerConfig {
        DataViewManagerConfig {
            prefetch_limit: self.prefetch_limit_bytes,
            sub_fetch_size: self.sub_fetch_size,
        }
    }
}
