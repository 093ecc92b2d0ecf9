//! Axis and channel descriptors

use crate::error::{Result, VdsError};
use crate::hash::{HashCombiner, HashValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Voxel formats supported by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Format {
    /// 1-bit values, packed eight to a byte
    OneBit = 0,
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Unsigned 16-bit integer
    U16 = 2,
    /// 32-bit floating point
    R32 = 3,
    /// Unsigned 32-bit integer
    U32 = 4,
    /// 64-bit floating point
    R64 = 5,
    /// Unsigned 64-bit integer
    U64 = 6,
}

impl Format {
    /// Size in bits of one component of this format
    pub fn bits(&self) -> usize {
        match self {
            Format::OneBit => 1,
            Format::U8 => 8,
            Format::U16 => 16,
            Format::R32 | Format::U32 => 32,
            Format::R64 | Format::U64 => 64,
        }
    }

    /// Size in bytes of one component, `None` for bit-packed formats
    pub fn size_in_bytes(&self) -> Option<usize> {
        match self {
            Format::OneBit => None,
            _ => Some(self.bits() / 8),
        }
    }

    /// Bytes needed to hold `voxels` voxels of `components` components
    pub fn buffer_size(&self, voxels: usize, components: Components) -> usize {
        (voxels * components.count() * self.bits() + 7) / 8
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Format::R32 | Format::R64)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Format::OneBit),
            1 => Some(Format::U8),
            2 => Some(Format::U16),
            3 => Some(Format::R32),
            4 => Some(Format::U32),
            5 => Some(Format::R64),
            6 => Some(Format::U64),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Number of components per voxel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Components {
    One = 1,
    Two = 2,
    Four = 4,
}

impl Components {
    pub fn count(&self) -> usize {
        *self as usize
    }

    pub fn from_count(count: usize) -> Result<Self> {
        match count {
            1 => Ok(Components::One),
            2 => Ok(Components::Two),
            4 => Ok(Components::Four),
            _ => Err(VdsError::InvalidArgument(format!(
                "A voxel has 1, 2 or 4 components, not {}",
                count
            ))),
        }
    }
}

/// Axis descriptor with name, unit, and coordinate information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisDescriptor {
    /// Number of samples along this axis
    pub num_samples: usize,
    /// Name of the axis (e.g., "Inline", "Crossline", "Sample")
    pub name: String,
    /// Unit of measurement (e.g., "m", "ms", "ft")
    pub unit: String,
    /// Coordinate of the first sample
    pub coordinate_min: f32,
    /// Coordinate of the last sample
    pub coordinate_max: f32,
}

impl AxisDescriptor {
    /// Create a new axis descriptor
    pub fn new(
        num_samples: usize,
        name: impl Into<String>,
        unit: impl Into<String>,
        coordinate_min: f32,
        coordinate_max: f32,
    ) -> Self {
        Self {
            num_samples,
            name: name.into(),
            unit: unit.into(),
            coordinate_min,
            coordinate_max,
        }
    }

    /// Get the step size between samples
    pub fn step(&self) -> f32 {
        if self.num_samples <= 1 {
            0.0
        } else {
            (self.coordinate_max - self.coordinate_min) / (self.num_samples - 1) as f32
        }
    }

    /// Convert sample index to coordinate
    pub fn sample_index_to_coordinate(&self, index: usize) -> f32 {
        self.coordinate_min + index as f32 * self.step()
    }

    /// Fractional sample position of a coordinate, unclamped
    pub fn coordinate_to_sample_position(&self, coordinate: f32) -> f32 {
        let step = self.step();
        if step == 0.0 {
            0.0
        } else {
            (coordinate - self.coordinate_min) / step
        }
    }

    /// Convert coordinate to the nearest sample index, clamped to the axis
    pub fn coordinate_to_sample_index(&self, coordinate: f32) -> usize {
        let last = self.num_samples.saturating_sub(1) as f32;
        self.coordinate_to_sample_position(coordinate)
            .round()
            .max(0.0)
            .min(last) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_samples == 0 {
            return Err(VdsError::InvalidArgument(format!(
                "Axis '{}' has no samples",
                self.name
            )));
        }
        if !self.coordinate_min.is_finite() || !self.coordinate_max.is_finite() {
            return Err(VdsError::InvalidArgument(format!(
                "Axis '{}' has a non-finite coordinate range",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn contents_hash(&self) -> u64 {
        HashCombiner::new()
            .add(&self.num_samples)
            .add(&self.name)
            .add(&self.unit)
            .add(&self.coordinate_min)
            .add(&self.coordinate_max)
            .finish()
    }
}

/// Value range for a channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f32,
    pub max: f32,
}

impl ValueRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// How a channel's samples map onto the volume's dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMapping {
    /// One value per voxel
    Direct,
    /// A fixed number of values per trace, replacing dimension 0
    PerTrace,
}

/// Behavioural flags of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags {
    /// Values are classes, not measurements
    pub discrete: bool,
    /// Lossy compression must not be applied
    pub no_lossy_compression: bool,
    pub renderable: bool,
    /// Use Zip rather than RLE when lossless compression is forced
    pub use_zip_for_lossless: bool,
}

impl Default for ChannelFlags {
    fn default() -> Self {
        Self {
            discrete: false,
            no_lossy_compression: false,
            renderable: true,
            use_zip_for_lossless: true,
        }
    }
}

/// Describes one channel (one value per voxel, or per trace) of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub format: Format,
    pub components: Components,
    pub name: String,
    pub unit: String,
    pub value_range: ValueRange,
    pub mapping: ChannelMapping,
    /// Values per trace for `PerTrace` channels, 1 otherwise
    pub mapped_value_count: usize,
    pub flags: ChannelFlags,
    pub no_value: Option<f32>,
    pub integer_scale: f32,
    pub integer_offset: f32,
}

impl ChannelDescriptor {
    pub fn new(format: Format, name: impl Into<String>, value_range: ValueRange) -> Self {
        Self {
            format,
            components: Components::One,
            name: name.into(),
            unit: String::new(),
            value_range,
            mapping: ChannelMapping::Direct,
            mapped_value_count: 1,
            flags: ChannelFlags::default(),
            no_value: None,
            integer_scale: 1.0,
            integer_offset: 0.0,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_components(mut self, components: Components) -> Self {
        self.components = components;
        self
    }

    /// Store `count` values per trace instead of one value per voxel
    pub fn with_per_trace_mapping(mut self, count: usize) -> Self {
        self.mapping = ChannelMapping::PerTrace;
        self.mapped_value_count = count;
        self
    }

    pub fn with_flags(mut self, flags: ChannelFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_no_value(mut self, no_value: f32) -> Self {
        self.no_value = Some(no_value);
        self
    }

    pub fn with_integer_scale_offset(mut self, scale: f32, offset: f32) -> Self {
        self.integer_scale = scale;
        self.integer_offset = offset;
        self
    }

    /// Convert a stored integer to its real value
    pub fn dequantize(&self, stored: f64) -> f64 {
        if self.format.is_float() {
            stored
        } else {
            stored * self.integer_scale as f64 + self.integer_offset as f64
        }
    }

    /// Convert a real value to the nearest stored integer
    pub fn quantize(&self, value: f64) -> f64 {
        if self.format.is_float() {
            value
        } else {
            ((value - self.integer_offset as f64) / self.integer_scale as f64).round()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.value_range.is_valid() {
            return Err(VdsError::InvalidArgument(format!(
                "Channel '{}' has an invalid value range {:?}",
                self.name, self.value_range
            )));
        }
        if self.mapped_value_count == 0 {
            return Err(VdsError::InvalidArgument(format!(
                "Channel '{}' maps zero values",
                self.name
            )));
        }
        if self.mapping == ChannelMapping::Direct && self.mapped_value_count != 1 {
            return Err(VdsError::InvalidArgument(format!(
                "Direct channel '{}' must map exactly one value",
                self.name
            )));
        }
        if self.integer_scale == 0.0 || !self.integer_scale.is_finite() {
            return Err(VdsError::InvalidArgument(format!(
                "Channel '{}' has an unusable integer scale",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn contents_hash(&self) -> u64 {
        HashCombiner::new()
            .add(&(self.format as u8))
            .add(&(self.components as u8))
            .add(&self.name)
            .add(&self.unit)
            .add(&self.value_range.min)
            .add(&self.value_range.max)
            .add(&(self.mapping == ChannelMapping::PerTrace))
            .add(&self.mapped_value_count)
            .add(&self.flags.discrete)
            .add(&self.flags.no_lossy_compression)
            .add(&self.flags.renderable)
            .add(&self.flags.use_zip_for_lossless)
            .add(&self.no_value)
            .add(&self.integer_scale)
            .add(&self.integer_offset)
            .finish()
    }
}

impl HashValue for AxisDescriptor {
    fn hash_value(&self) -> u64 {
        self.contents_hash()
    }
}

impl HashValue for ChannelDescriptor {
    fn hash_value(&self) -> u64 {
        self.contents_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(Format::U8.size_in_bytes(), Some(1));
        assert_eq!(Format::U16.size_in_bytes(), Some(2));
        assert_eq!(Format::R32.size_in_bytes(), Some(4));
        assert_eq!(Format::R64.size_in_bytes(), Some(8));
        assert_eq!(Format::OneBit.size_in_bytes(), None);
        assert_eq!(Format::OneBit.buffer_size(9, Components::One), 2);
        assert_eq!(Format::R32.buffer_size(10, Components::Two), 80);
    }

    #[test]
    fn test_axis_descriptor() {
        let axis = AxisDescriptor::new(101, "Depth", "m", 0.0, 1000.0);
        assert_eq!(axis.step(), 10.0);
        assert_eq!(axis.sample_index_to_coordinate(0), 0.0);
        assert_eq!(axis.sample_index_to_coordinate(100), 1000.0);
        assert_eq!(axis.coordinate_to_sample_index(500.0), 50);
        assert_eq!(axis.coordinate_to_sample_index(-50.0), 0);
        assert_eq!(axis.coordinate_to_sample_index(5000.0), 100);
    }

    #[test]
    fn test_axis_rounds_to_nearest() {
        let axis = AxisDescriptor::new(4, "X", "", 0.0, 3.0);
        assert_eq!(axis.coordinate_to_sample_index(1.5), 2);
        assert_eq!(axis.sample_index_to_coordinate(2), 2.0);
    }

    #[test]
    fn test_axis_round_trip() {
        let axis = AxisDescriptor::new(251, "Sample", "ms", 100.0, 1100.0);
        for i in 0..axis.num_samples {
            let c = axis.sample_index_to_coordinate(i);
            assert_eq!(axis.coordinate_to_sample_index(c), i);
        }
    }

    #[test]
    fn test_single_sample_axis() {
        let axis = AxisDescriptor::new(1, "Y", "", 5.0, 5.0);
        assert_eq!(axis.step(), 0.0);
        assert_eq!(axis.coordinate_to_sample_index(42.0), 0);
        assert_eq!(axis.sample_index_to_coordinate(0), 5.0);
    }

    #[test]
    fn test_invalid_descriptors_are_representable() {
        let axis = AxisDescriptor::new(0, "Empty", "", 0.0, 1.0);
        assert!(matches!(axis.validate(), Err(VdsError::InvalidArgument(_))));

        let channel = ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(1.0, -1.0));
        assert!(channel.validate().is_err());

        let channel = ChannelDescriptor::new(Format::R32, "Trace", ValueRange::new(0.0, 1.0))
            .with_per_trace_mapping(0);
        assert!(channel.validate().is_err());
    }

    #[test]
    fn test_quantization() {
        let channel = ChannelDescriptor::new(Format::U8, "Class", ValueRange::new(-1.0, 1.0))
            .with_integer_scale_offset(2.0 / 255.0, -1.0);
        let stored = channel.quantize(0.0);
        assert!((channel.dequantize(stored) - 0.0).abs() < 0.01);

        let float = ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(-1.0, 1.0));
        assert_eq!(float.quantize(0.25), 0.25);
    }
}
