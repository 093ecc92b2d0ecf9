//! A layer is one channel of a volume at one LOD, chunked by one dimension group

use crate::compression::CompressionMethod;
use crate::dimension_group::{DimensionGroup, MAX_DIMENSIONALITY};
use crate::error::{Result, VdsError};
use crate::layout::VolumeDataLayout;
use crate::partition::VolumeDataPartition;
use crate::types::{ChannelDescriptor, ChannelMapping, Components, Format};

#[derive(Debug, Clone)]
pub struct VolumeDataLayer {
    partition: VolumeDataPartition,
    channel: usize,
    channel_descriptor: ChannelDescriptor,
    compression_method: CompressionMethod,
    compression_tolerance: f32,
    name: String,
}

impl VolumeDataLayer {
    pub(crate) fn new(
        layout: &VolumeDataLayout,
        dimension_group: DimensionGroup,
        lod: u32,
        channel: usize,
    ) -> Result<Self> {
        let channel_descriptor = layout.channel(channel)?.clone();
        let descriptor = layout.descriptor();

        if lod > descriptor.lod_levels {
            return Err(VdsError::IndexOutOfRange(format!(
                "LOD {} requested from a layout with {} LOD levels",
                lod, descriptor.lod_levels
            )));
        }
        if let Some(d) = dimension_group
            .dimensions()
            .find(|d| *d >= layout.dimensionality())
        {
            return Err(VdsError::InvalidArgument(format!(
                "{} uses dimension {} of a {}D layout",
                dimension_group,
                d,
                layout.dimensionality()
            )));
        }

        let mut num_samples = layout.num_samples_array();
        let mut brick_size = [descriptor.brick_size.samples(); MAX_DIMENSIONALITY];
        let mut negative_margin = [descriptor.negative_margin; MAX_DIMENSIONALITY];
        let mut positive_margin = [descriptor.positive_margin; MAX_DIMENSIONALITY];
        let mut lod_decimated = [false; MAX_DIMENSIONALITY];
        for d in dimension_group.dimensions() {
            lod_decimated[d] = descriptor.full_resolution_dimension != Some(d);
        }

        // Per trace channels replace dimension 0 with the values of one trace,
        // all stored in a single brick.
        let mut chunk_group = dimension_group;
        if channel_descriptor.mapping == ChannelMapping::PerTrace {
            let count = channel_descriptor.mapped_value_count;
            chunk_group = dimension_group.union(DimensionGroup::D0)?;
            num_samples[0] = count;
            brick_size[0] = count;
            negative_margin[0] = 0;
            positive_margin[0] = 0;
            lod_decimated[0] = false;
        }

        let partition = VolumeDataPartition::new(
            lod,
            chunk_group,
            num_samples,
            brick_size,
            negative_margin,
            positive_margin,
            lod_decimated,
        )?;

        let (compression_method, compression_tolerance) = effective_compression(
            &channel_descriptor,
            descriptor.compression_method,
            descriptor.compression_tolerance,
            lod,
        );

        let prefix = if channel == 0 {
            ""
        } else {
            channel_descriptor.name.as_str()
        };
        let name = format!("{}{}LOD{}", prefix, dimension_group, lod);

        Ok(Self {
            partition,
            channel,
            channel_descriptor,
            compression_method,
            compression_tolerance,
            name,
        })
    }

    pub fn partition(&self) -> &VolumeDataPartition {
        &self.partition
    }

    pub fn channel_index(&self) -> usize {
        self.channel
    }

    pub fn channel_descriptor(&self) -> &ChannelDescriptor {
        &self.channel_descriptor
    }

    pub fn format(&self) -> Format {
        self.channel_descriptor.format
    }

    pub fn components(&self) -> Components {
        self.channel_descriptor.components
    }

    pub fn lod(&self) -> u32 {
        self.partition.lod()
    }

    pub fn dimension_group(&self) -> DimensionGroup {
        self.partition.dimension_group()
    }

    /// Layer name, e.g. `Dimensions_012LOD0`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the stored object holding `chunk`
    pub fn chunk_object_name(&self, chunk: u64) -> String {
        crate::utils::chunk_object_name(&self.name, chunk)
    }

    pub fn compression_method(&self) -> CompressionMethod {
        self.compression_method
    }

    pub fn compression_tolerance(&self) -> f32 {
        self.compression_tolerance
    }
}

fn effective_compression(
    channel: &ChannelDescriptor,
    method: CompressionMethod,
    tolerance: f32,
    lod: u32,
) -> (CompressionMethod, f32) {
    let forced_lossless = channel.flags.no_lossy_compression || channel.format == Format::OneBit;
    let method = if forced_lossless && method.is_lossy() {
        if channel.flags.use_zip_for_lossless {
            CompressionMethod::Zip
        } else {
            CompressionMethod::Rle
        }
    } else {
        method
    };

    // Decimated levels tolerate proportionally larger errors
    let tolerance = if method.is_lossy() {
        tolerance * (1u32 << lod) as f32
    } else {
        0.0
    };
    (method, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrickSize, LayoutDescriptor};
    use crate::types::{AxisDescriptor, ChannelFlags, ValueRange};

    fn layout(descriptor: LayoutDescriptor) -> VolumeDataLayout {
        VolumeDataLayout::new(
            vec![
                AxisDescriptor::new(100, "Sample", "ms", 0.0, 396.0),
                AxisDescriptor::new(60, "Crossline", "", 1.0, 60.0),
                AxisDescriptor::new(40, "Inline", "", 1.0, 40.0),
            ],
            vec![
                ChannelDescriptor::new(Format::R32, "Amplitude", ValueRange::new(-1.0, 1.0)),
                ChannelDescriptor::new(Format::U8, "Trace", ValueRange::new(0.0, 1.0))
                    .with_per_trace_mapping(1)
                    .with_flags(ChannelFlags {
                        no_lossy_compression: true,
                        use_zip_for_lossless: false,
                        ..ChannelFlags::default()
                    }),
            ],
            descriptor,
        )
    }

    #[test]
    fn test_layer_names() {
        let layout = layout(LayoutDescriptor::new(BrickSize::Size32).with_lod_levels(2));
        let primary = layout.layer(DimensionGroup::D012, 0, 0).unwrap();
        assert_eq!(primary.name(), "Dimensions_012LOD0");
        assert_eq!(primary.chunk_object_name(5), "Dimensions_012LOD0/5");

        let trace = layout.layer(DimensionGroup::D012, 1, 1).unwrap();
        assert_eq!(trace.name(), "TraceDimensions_012LOD1");
    }

    #[test]
    fn test_invalid_layer_requests() {
        let layout = layout(LayoutDescriptor::new(BrickSize::Size32));
        assert!(matches!(
            layout.layer(DimensionGroup::D012, 1, 0),
            Err(VdsError::IndexOutOfRange(_))
        ));
        assert!(layout.layer(DimensionGroup::D012, 0, 2).is_err());
        let g03 = DimensionGroup::from_indices(&[0, 3]).unwrap();
        assert!(matches!(
            layout.layer(g03, 0, 0),
            Err(VdsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_per_trace_mapping() {
        let layout = layout(LayoutDescriptor::new(BrickSize::Size32));
        let g12 = DimensionGroup::from_indices(&[1, 2]).unwrap();
        let layer = layout.layer(g12, 0, 1).unwrap();
        let partition = layer.partition();
        assert_eq!(partition.num_samples(0), 1);
        assert_eq!(partition.chunks_in_dimension(0), 1);
        assert_eq!(partition.chunks_in_dimension(1), 2);
        assert_eq!(partition.chunks_in_dimension(2), 2);
        assert_eq!(layer.name(), "TraceDimensions_12LOD0");
    }

    #[test]
    fn test_lossless_channels_override_lossy_methods() {
        let layout = layout(
            LayoutDescriptor::new(BrickSize::Size32)
                .with_lod_levels(1)
                .with_compression(CompressionMethod::Wavelet, 0.5),
        );
        let amplitude = layout.layer(DimensionGroup::D012, 1, 0).unwrap();
        assert_eq!(amplitude.compression_method(), CompressionMethod::Wavelet);
        assert_eq!(amplitude.compression_tolerance(), 1.0);

        let trace = layout.layer(DimensionGroup::D012, 0, 1).unwrap();
        assert_eq!(trace.compression_method(), CompressionMethod::Rle);
        assert_eq!(trace.compression_tolerance(), 0.0);
    }
}
