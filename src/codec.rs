//! Chunk encoding and decoding

use crate::buffer::PageBuffer;
use crate::compression::{get_compressor, CompressionLevel, CompressionMethod};
use crate::dimension_group::DimensionGroup;
use crate::error::{Result, VdsError};
use crate::partition::IndexArray;
use crate::types::{Components, Format};
use crate::VDS_MAGIC;
use serde::{Deserialize, Serialize};

/// Turns stored chunk bytes into voxel buffers and back
pub trait ChunkCodec: Send + Sync {
    /// Decode a chunk that must hold exactly `expected_shape` voxels
    fn decode_chunk(
        &self,
        data: &[u8],
        format: Format,
        components: Components,
        dimension_group: DimensionGroup,
        expected_shape: &IndexArray,
    ) -> Result<PageBuffer>;

    /// Encode a buffer with the given compression
    fn encode_chunk(
        &self,
        buffer: &PageBuffer,
        dimension_group: DimensionGroup,
        method: CompressionMethod,
        tolerance: f32,
    ) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DataBlockHeader {
    magic: [u8; 4],
    format: Format,
    components: Components,
    dimension_group: DimensionGroup,
    shape: [u64; 6],
    method: CompressionMethod,
    payload_size: u64,
}

/// Default codec: a bincode header followed by the compressed voxels
#[derive(Debug, Clone, Copy, Default)]
pub struct DataBlockCodec {
    level: CompressionLevel,
}

impl DataBlockCodec {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompressionLevel {
        self.level
    }
}

fn element_size(format: Format, components: Components) -> usize {
    format.size_in_bytes().map_or(1, |size| size * components.count())
}

impl ChunkCodec for DataBlockCodec {
    fn decode_chunk(
        &self,
        data: &[u8],
        format: Format,
        components: Components,
        dimension_group: DimensionGroup,
        expected_shape: &IndexArray,
    ) -> Result<PageBuffer> {
        let header: DataBlockHeader = bincode::deserialize(data)
            .map_err(|e| VdsError::Codec(format!("Unreadable chunk header: {}", e)))?;
        if &header.magic != VDS_MAGIC {
            return Err(VdsError::Codec("Chunk does not start with the VDS magic".to_string()));
        }
        if header.format != format || header.components != components {
            return Err(VdsError::Codec(format!(
                "Chunk holds {} x{} voxels, expected {} x{}",
                header.format,
                header.components.count(),
                format,
                components.count()
            )));
        }
        if !header.dimension_group.is_remapping_possible(dimension_group)
            && !dimension_group.is_remapping_possible(header.dimension_group)
        {
            return Err(VdsError::Codec(format!(
                "Chunk was written for {}, cannot be read as {}",
                header.dimension_group, dimension_group
            )));
        }
        let shape = header.shape.map(|s| s as usize);
        if &shape != expected_shape {
            return Err(VdsError::Codec(format!(
                "Chunk shape {:?} does not match expected {:?}",
                shape, expected_shape
            )));
        }

        let header_size = bincode::serialized_size(&header)? as usize;
        let payload = &data[header_size..];
        if payload.len() as u64 != header.payload_size {
            return Err(VdsError::Codec(format!(
                "Chunk payload is {} bytes, header says {}",
                payload.len(),
                header.payload_size
            )));
        }

        let voxels: usize = shape.iter().product();
        let expected_size = format.buffer_size(voxels, components);
        let decoded = get_compressor(header.method)?.decompress(
            payload,
            element_size(format, components),
            expected_size,
        )?;
        PageBuffer::from_bytes(format, components, shape, &decoded)
    }

    fn encode_chunk(
        &self,
        buffer: &PageBuffer,
        dimension_group: DimensionGroup,
        method: CompressionMethod,
        _tolerance: f32,
    ) -> Result<Vec<u8>> {
        let payload = get_compressor(method)?.compress(
            buffer.as_bytes(),
            element_size(buffer.format(), buffer.components()),
            self.level,
        )?;
        let header = DataBlockHeader {
            magic: *VDS_MAGIC,
            format: buffer.format(),
            components: buffer.components(),
            dimension_group,
            shape: (*buffer.shape()).map(|s| s as u64),
            method,
            payload_size: payload.len() as u64,
        };
        let mut encoded = bincode::serialize(&header)?;
        encoded.extend_from_slice(&payload);
        Ok(encoded)
    }
}
