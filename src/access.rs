//! Volume data access - main API for reading/writing VDS volumes

use crate::codec::{ChunkCodec, DataBlockCodec};
use crate::config::VdsConfig;
use crate::dimension_group::DimensionGroup;
use crate::error::Result;
use crate::io::{create_io_manager, IOManager};
use crate::layout::VolumeDataLayout;
use crate::metadata::VdsMetadata;
use crate::page::AccessMode;
use crate::page_accessor::VolumeDataPageAccessor;
use crate::request::IoDispatcher;
use crate::store::VolumeDataStore;
use parking_lot::RwLock;
use std::sync::Arc;

/// Main interface for accessing VDS volume data
pub struct VolumeDataAccess {
    /// Dataset document
    metadata: RwLock<VdsMetadata>,

    /// Layout shared with every page accessor
    layout: Arc<VolumeDataLayout>,

    /// Chunk storage
    store: Arc<VolumeDataStore>,

    config: VdsConfig,
}

impl VolumeDataAccess {
    /// Open an existing VDS volume
    pub fn open(url: &str, config: VdsConfig) -> Result<Self> {
        Self::open_with_io_manager(create_io_manager(url)?, config)
    }

    /// Create a new VDS volume
    pub fn create(url: &str, layout: VolumeDataLayout, config: VdsConfig) -> Result<Self> {
        Self::with_io_manager(create_io_manager(url)?, layout, config)
    }

    /// Create a new VDS volume on an application provided backend
    pub fn with_io_manager(io_manager: Arc<dyn IOManager>, layout: VolumeDataLayout, config: VdsConfig) -> Result<Self> {
        config.validate()?;
        layout.validate()?;
        let store = Self::build_store(io_manager, &config)?;

        let metadata = VdsMetadata::new(layout);
        store.write_metadata(&metadata)?.take()?;
        tracing::debug!("Created volume: {}", metadata.layout.summary());
        Ok(Self::from_parts(metadata, store, config))
    }

    /// Open an existing VDS volume on an application provided backend
    pub fn open_with_io_manager(io_manager: Arc<dyn IOManager>, config: VdsConfig) -> Result<Self> {
        config.validate()?;
        let store = Self::build_store(io_manager, &config)?;
        let metadata = store.read_metadata()?;
        tracing::debug!("Opened volume: {}", metadata.layout.summary());
        Ok(Self::from_parts(metadata, store, config))
    }

    fn build_store(io_manager: Arc<dyn IOManager>, config: &VdsConfig) -> Result<Arc<VolumeDataStore>> {
        let dispatcher = Arc::new(IoDispatcher::new(io_manager, config.io_threads)?);
        let codec: Arc<dyn ChunkCodec> = Arc::new(DataBlockCodec::new(config.compression_level()));
        Ok(Arc::new(VolumeDataStore::new(
            dispatcher,
            codec,
            config.view_manager_config(),
        )))
    }

    fn from_parts(metadata: VdsMetadata, store: Arc<VolumeDataStore>, config: VdsConfig) -> Self {
        Self {
            layout: Arc::new(metadata.layout.clone()),
            metadata: RwLock::new(metadata),
            store,
            config,
        }
    }

    /// Get the volume metadata
    pub fn metadata(&self) -> VdsMetadata {
        self.metadata.read().clone()
    }

    /// Get the volume layout
    pub fn layout(&self) -> &Arc<VolumeDataLayout> {
        &self.layout
    }

    pub fn config(&self) -> &VdsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VolumeDataStore> {
        &self.store
    }

    /// Set a custom metadata entry and store the updated document
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let document = {
            let mut metadata = self.metadata.write();
            metadata.add_metadata(key, value);
            metadata.touch();
            metadata.clone()
        };
        self.store.write_metadata(&document)?.take()
    }

    /// Page accessor for one channel at one LOD, chunked by `dimension_group`.
    /// `max_pages` of `None` uses the configured default.
    pub fn create_page_accessor(
        &self,
        dimension_group: DimensionGroup,
        lod: u32,
        channel: usize,
        max_pages: Option<usize>,
        mode: AccessMode,
    ) -> Result<VolumeDataPageAccessor> {
        let layer = self.layout.layer(dimension_group, lod, channel)?;
        VolumeDataPageAccessor::new(
            Arc::clone(&self.layout),
            layer,
            Arc::clone(&self.store),
            mode,
            max_pages.unwrap_or(self.config.max_pages),
            self.config.page_wait_timeout(),
        )
    }

    /// Get statistics about the volume
    pub fn get_stats(&self) -> VolumeStats {
        let layout = &self.layout;
        let descriptor = layout.descriptor();
        let uncompressed_size = layout
            .channels()
            .iter()
            .map(|c| c.format.buffer_size(1, c.components) as u64)
            .sum::<u64>()
            * layout.total_voxels();

        VolumeStats {
            dimensionality: layout.dimensionality(),
            total_voxels: layout.total_voxels(),
            channel_count: layout.channel_count(),
            lod_levels: descriptor.lod_levels,
            uncompressed_size,
            compression_method: descriptor.compression_method,
        }
    }
}

impl std::fmt::Debug for VolumeDataAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDataAccess")
            .field("layout", &self.layout.summary())
            .field("store", &self.store)
            .finish()
    }
}

/// Volume statistics
#[derive(Debug, Clone)]
pub struct VolumeStats {
    pub dimensionality: usize,
    pub total_voxels: u64,
    pub channel_count: usize,
    pub lod_levels: u32,
    /// Approximate size of LOD 0 for all channels, one bit formats rounded up
    pub uncompressed_size: u64,
    pub compression_method: crate::compression::CompressionMethod,
}

impl VolumeStats {
    pub fn summary(&self) -> String {
        format!(
            "{}D Volume: {} voxels, {} channels, {} LOD levels, {} uncompressed ({:?})",
            self.dimensionality,
            self.total_voxels,
            self.channel_count,
            self.lod_levels,
            crate::utils::format_bytes(self.uncompressed_size),
            self.compression_method,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, LayoutDescriptor};
    use crate::types::{AxisDescriptor, ChannelDescriptor, Format, ValueRange};
    use tempfile::TempDir;

    fn layout() -> VolumeDataLayout {
        let axes = vec![
            AxisDescriptor::new(100, "X", "m", 0.0, 99.0),
            AxisDescriptor::new(100, "Y", "m", 0.0, 99.0),
            AxisDescriptor::new(100, "Z", "m", 0.0, 99.0),
        ];
        let channels = vec![ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(-1.0, 1.0))];
        VolumeDataLayout::new(axes, channels, LayoutDescriptor::new(BrickSize::Size64))
    }

    #[test]
    fn test_create_and_open_volume() {
        let temp_dir = TempDir::new().unwrap();
        let url = temp_dir.path().to_str().unwrap();

        let created = VolumeDataAccess::create(url, layout(), VdsConfig::default()).unwrap();
        created.set_metadata("project", "North Sea Survey").unwrap();

        let vds = VolumeDataAccess::open(url, VdsConfig::default()).unwrap();
        let stats = vds.get_stats();
        assert_eq!(stats.dimensionality, 3);
        assert_eq!(stats.total_voxels, 100 * 100 * 100);
        assert_eq!(stats.uncompressed_size, 4 * 100 * 100 * 100);
        assert_eq!(vds.metadata().get_metadata("project"), Some("North Sea Survey"));
        assert_eq!(**vds.layout(), layout());
    }

    #[test]
    fn test_invalid_layout_is_rejected() {
        let bad = VolumeDataLayout::new(
            vec![AxisDescriptor::new(0, "X", "m", 0.0, 1.0)],
            vec![ChannelDescriptor::new(Format::U8, "Value", ValueRange::new(0.0, 1.0))],
            LayoutDescriptor::default(),
        );
        let err = VolumeDataAccess::create("inmemory://access-invalid", bad, VdsConfig::default()).unwrap_err();
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn test_open_missing_volume() {
        let err = VolumeDataAccess::open("inmemory://access-missing", VdsConfig::default()).unwrap_err();
        assert_eq!(err.code(), crate::error::NOT_FOUND_CODE);
    }

    #[test]
    fn test_read_only_accessor_cannot_create() {
        let vds = VolumeDataAccess::create("inmemory://access-readonly", layout(), VdsConfig::default()).unwrap();
        let accessor = vds
            .create_page_accessor(DimensionGroup::D012, 0, 0, None, AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(accessor.max_pages(), 8);
        assert!(matches!(
            accessor.create_page(0),
            Err(crate::error::VdsError::State(_))
        ));
    }
}
