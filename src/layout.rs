//! Volume data layout - axes, channels and how the volume is divided into chunks

use crate::compression::CompressionMethod;
use crate::dimension_group::{DimensionGroup, MAX_DIMENSIONALITY};
use crate::error::{Result, VdsError};
use crate::hash::HashCombiner;
use crate::layer::VolumeDataLayer;
use crate::partition::IndexArray;
use crate::types::{AxisDescriptor, ChannelDescriptor, ChannelMapping};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Edge length of a brick, in voxels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BrickSize {
    Size32 = 5,
    Size64 = 6,
    Size128 = 7,
    Size256 = 8,
    Size512 = 9,
    Size1024 = 10,
    Size2048 = 11,
    Size4096 = 12,
}

impl BrickSize {
    /// Brick edge length in voxels
    pub fn samples(&self) -> usize {
        1 << (*self as u8)
    }

    pub fn from_samples(samples: usize) -> Result<Self> {
        match samples {
            32 => Ok(BrickSize::Size32),
            64 => Ok(BrickSize::Size64),
            128 => Ok(BrickSize::Size128),
            256 => Ok(BrickSize::Size256),
            512 => Ok(BrickSize::Size512),
            1024 => Ok(BrickSize::Size1024),
            2048 => Ok(BrickSize::Size2048),
            4096 => Ok(BrickSize::Size4096),
            _ => Err(VdsError::InvalidArgument(format!(
                "Brick size {} is not a power of two between 32 and 4096",
                samples
            ))),
        }
    }
}

impl Default for BrickSize {
    fn default() -> Self {
        BrickSize::Size64
    }
}

/// Highest LOD level a layout can request
pub const MAX_LOD_LEVELS: u32 = 12;

/// How chunks of a layout are shaped and compressed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutDescriptor {
    pub brick_size: BrickSize,
    /// Margin stored before each brick, in voxels
    pub negative_margin: usize,
    /// Margin stored after each brick, in voxels
    pub positive_margin: usize,
    /// Number of decimated levels above full resolution
    pub lod_levels: u32,
    /// Dimension kept at full resolution in every LOD
    pub full_resolution_dimension: Option<usize>,
    pub compression_method: CompressionMethod,
    pub compression_tolerance: f32,
}

impl LayoutDescriptor {
    pub fn new(brick_size: BrickSize) -> Self {
        Self {
            brick_size,
            negative_margin: 0,
            positive_margin: 0,
            lod_levels: 0,
            full_resolution_dimension: None,
            compression_method: CompressionMethod::None,
            compression_tolerance: 0.0,
        }
    }

    /// Set margins
    pub fn with_margins(mut self, negative_margin: usize, positive_margin: usize) -> Self {
        self.negative_margin = negative_margin;
        self.positive_margin = positive_margin;
        self
    }

    /// Set the number of LOD levels
    pub fn with_lod_levels(mut self, lod_levels: u32) -> Self {
        self.lod_levels = lod_levels;
        self
    }

    pub fn with_full_resolution_dimension(mut self, dimension: usize) -> Self {
        self.full_resolution_dimension = Some(dimension);
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod, tolerance: f32) -> Self {
        self.compression_method = method;
        self.compression_tolerance = tolerance;
        self
    }
}

impl Default for LayoutDescriptor {
    fn default() -> Self {
        Self::new(BrickSize::default())
    }
}

/// Layout of volume data - immutable description of a volume's axes and channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDataLayout {
    axes: Vec<AxisDescriptor>,
    channels: Vec<ChannelDescriptor>,
    descriptor: LayoutDescriptor,
    metadata: BTreeMap<String, String>,
}

impl VolumeDataLayout {
    /// Create a new layout. Use [`validate`](Self::validate) before storing
    /// data with it.
    pub fn new(
        axes: Vec<AxisDescriptor>,
        channels: Vec<ChannelDescriptor>,
        descriptor: LayoutDescriptor,
    ) -> Self {
        Self {
            axes,
            channels,
            descriptor,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn dimensionality(&self) -> usize {
        self.axes.len()
    }

    pub fn axes(&self) -> &[AxisDescriptor] {
        &self.axes
    }

    pub fn axis(&self, dimension: usize) -> Result<&AxisDescriptor> {
        self.axes.get(dimension).ok_or_else(|| {
            VdsError::IndexOutOfRange(format!(
                "Dimension {} is outside a {}D layout",
                dimension,
                self.axes.len()
            ))
        })
    }

    /// Number of samples in `dimension`, 1 for dimensions the layout lacks
    pub fn num_samples(&self, dimension: usize) -> usize {
        self.axes.get(dimension).map(|a| a.num_samples).unwrap_or(1)
    }

    pub fn num_samples_array(&self) -> IndexArray {
        let mut samples = [1; MAX_DIMENSIONALITY];
        for (d, axis) in self.axes.iter().take(MAX_DIMENSIONALITY).enumerate() {
            samples[d] = axis.num_samples;
        }
        samples
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn channel(&self, channel: usize) -> Result<&ChannelDescriptor> {
        self.channels.get(channel).ok_or_else(|| {
            VdsError::IndexOutOfRange(format!(
                "Channel {} requested from a layout with {} channels",
                channel,
                self.channels.len()
            ))
        })
    }

    /// Index of the channel called `name`
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    pub fn descriptor(&self) -> &LayoutDescriptor {
        &self.descriptor
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    /// Total number of voxels at full resolution
    pub fn total_voxels(&self) -> u64 {
        self.axes.iter().map(|a| a.num_samples as u64).product()
    }

    /// Stable hash over every field of the layout
    pub fn contents_hash(&self) -> u64 {
        let mut combiner = HashCombiner::new()
            .add_all(&self.axes)
            .add_all(&self.channels)
            .add(&(self.descriptor.brick_size as u8))
            .add(&self.descriptor.negative_margin)
            .add(&self.descriptor.positive_margin)
            .add(&self.descriptor.lod_levels)
            .add(&self.descriptor.full_resolution_dimension.map(|d| d as u64))
            .add(&(self.descriptor.compression_method as u8))
            .add(&self.descriptor.compression_tolerance);
        for (key, value) in &self.metadata {
            combiner = combiner.add(key).add(value);
        }
        combiner.finish()
    }

    /// Check that data can be stored with this layout
    pub fn validate(&self) -> Result<()> {
        let dimensionality = self.dimensionality();
        if dimensionality == 0 || dimensionality > MAX_DIMENSIONALITY {
            return Err(VdsError::InvalidArgument(format!(
                "Dimensionality must be between 1 and {}, got {}",
                MAX_DIMENSIONALITY, dimensionality
            )));
        }
        for axis in &self.axes {
            axis.validate()?;
        }

        if self.channels.is_empty() {
            return Err(VdsError::InvalidArgument(
                "A layout needs at least one channel".to_string(),
            ));
        }
        for channel in &self.channels {
            channel.validate()?;
        }
        if self.channels[0].mapping != ChannelMapping::Direct {
            return Err(VdsError::InvalidArgument(
                "The primary channel must use direct mapping".to_string(),
            ));
        }

        if self.descriptor.lod_levels > MAX_LOD_LEVELS {
            return Err(VdsError::InvalidArgument(format!(
                "At most {} LOD levels are supported",
                MAX_LOD_LEVELS
            )));
        }
        if let Some(dimension) = self.descriptor.full_resolution_dimension {
            if dimension >= dimensionality {
                return Err(VdsError::InvalidArgument(format!(
                    "Full resolution dimension {} is outside a {}D layout",
                    dimension, dimensionality
                )));
            }
        }
        let brick = self.descriptor.brick_size.samples();
        if self.descriptor.negative_margin + self.descriptor.positive_margin >= brick {
            return Err(VdsError::InvalidArgument(format!(
                "Margins {}+{} do not fit in a brick of {}",
                self.descriptor.negative_margin, self.descriptor.positive_margin, brick
            )));
        }
        Ok(())
    }

    /// Layer storing `channel` at `lod` in chunks shaped by `dimension_group`
    pub fn layer(&self, dimension_group: DimensionGroup, lod: u32, channel: usize) -> Result<VolumeDataLayer> {
        VolumeDataLayer::new(self, dimension_group, lod, channel)
    }

    /// Get a summary string of the layout
    pub fn summary(&self) -> String {
        let size_str = self
            .axes
            .iter()
            .map(|a| a.num_samples.to_string())
            .collect::<Vec<_>>()
            .join(" x ");
        let channel_str = self
            .channels
            .iter()
            .map(|c| format!("{} ({})", c.name, c.format))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}D Volume: {}, channels: {}, brick {}, {} LOD levels",
            self.dimensionality(),
            size_str,
            channel_str,
            self.descriptor.brick_size.samples(),
            self.descriptor.lod_levels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Format, ValueRange};

    fn create_test_layout() -> VolumeDataLayout {
        let axes = vec![
            AxisDescriptor::new(1000, "Inline", "trace", 0.0, 999.0),
            AxisDescriptor::new(800, "Crossline", "trace", 0.0, 799.0),
            AxisDescriptor::new(500, "Sample", "ms", 0.0, 2000.0),
        ];
        let channels = vec![ChannelDescriptor::new(
            Format::R32,
            "Amplitude",
            ValueRange::new(-1000.0, 1000.0),
        )];

        VolumeDataLayout::new(axes, channels, LayoutDescriptor::new(BrickSize::Size64))
    }

    #[test]
    fn test_layout_creation() {
        let layout = create_test_layout();
        assert_eq!(layout.dimensionality(), 3);
        assert_eq!(layout.num_samples_array(), [1000, 800, 500, 1, 1, 1]);
        assert_eq!(layout.channel_index("Amplitude"), Some(0));
        assert!(layout.channel(1).is_err());
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_brick_sizes() {
        assert_eq!(BrickSize::Size32.samples(), 32);
        assert_eq!(BrickSize::Size4096.samples(), 4096);
        assert_eq!(BrickSize::from_samples(128).unwrap(), BrickSize::Size128);
        assert!(BrickSize::from_samples(100).is_err());
    }

    #[test]
    fn test_invalid_layout_fails_validation() {
        let axes = vec![AxisDescriptor::new(0, "Inline", "", 0.0, 1.0)];
        let channels = vec![ChannelDescriptor::new(Format::U8, "Value", ValueRange::new(0.0, 255.0))];
        let layout = VolumeDataLayout::new(axes, channels, LayoutDescriptor::default());
        assert!(matches!(layout.validate(), Err(VdsError::InvalidArgument(_))));

        let no_channels = VolumeDataLayout::new(
            vec![AxisDescriptor::new(10, "X", "", 0.0, 9.0)],
            Vec::new(),
            LayoutDescriptor::default(),
        );
        assert!(no_channels.validate().is_err());

        let too_many_lods = create_test_layout();
        let too_many_lods = VolumeDataLayout::new(
            too_many_lods.axes().to_vec(),
            too_many_lods.channels().to_vec(),
            LayoutDescriptor::default().with_lod_levels(13),
        );
        assert!(too_many_lods.validate().is_err());
    }

    #[test]
    fn test_contents_hash() {
        let a = create_test_layout();
        let b = create_test_layout();
        assert_eq!(a.contents_hash(), b.contents_hash());

        let c = create_test_layout().with_metadata("survey", "North Sea");
        assert_ne!(a.contents_hash(), c.contents_hash());
    }

    #[test]
    fn test_serde_round_trip_keeps_hash() {
        let layout = create_test_layout().with_metadata("survey", "North Sea");
        let json = serde_json::to_string(&layout).unwrap();
        let decoded: VolumeDataLayout = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, layout);
        assert_eq!(decoded.contents_hash(), layout.contents_hash());
    }
}
