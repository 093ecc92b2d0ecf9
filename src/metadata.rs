//! Dataset document: format version, layout and user entries

use crate::error::{Result, VdsError};
use crate::layout::VolumeDataLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the dataset document. Readers accept any minor version of
/// their own major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdsVersion {
    pub major: u16,
    pub minor: u16,
}

impl VdsVersion {
    pub const CURRENT: Self = Self { major: 3, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for VdsVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Dataset document stored next to the chunks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdsMetadata {
    pub version: VdsVersion,

    pub layout: VolumeDataLayout,

    /// Hash of the layout when the document was written
    pub layout_hash: u64,

    pub created_at: DateTime<Utc>,

    /// Bumped by `touch` on every rewrite
    pub modified_at: DateTime<Utc>,

    /// Application entries, kept sorted so rewrites are stable
    pub custom_metadata: BTreeMap<String, String>,
}

impl VdsMetadata {
    /// Document for a freshly created dataset
    pub fn new(layout: VolumeDataLayout) -> Self {
        let now = Utc::now();
        Self {
            version: VdsVersion::default(),
            layout_hash: layout.contents_hash(),
            layout,
            created_at: now,
            modified_at: now,
            custom_metadata: BTreeMap::new(),
        }
    }

    /// Insert or replace an application entry
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(String::as_str)
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Check a document read back from storage
    pub fn check(&self) -> Result<()> {
        if !self.version.is_compatible(&VdsVersion::CURRENT) {
            return Err(VdsError::Serialization(format!(
                "Dataset version {}.{} cannot be read by version {}.{}",
                self.version.major,
                self.version.minor,
                VdsVersion::CURRENT.major,
                VdsVersion::CURRENT.minor
            )));
        }
        if self.layout.contents_hash() != self.layout_hash {
            return Err(VdsError::Serialization(
                "Stored layout does not match its recorded hash".to_string(),
            ));
        }
        self.layout.validate()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let metadata: VdsMetadata = serde_json::from_slice(data)?;
        metadata.check()?;
        Ok(metadata)
    }
}
