//! Chunk addressing for one layer of a volume
//!
//! A partition splits the dimensions of a dimension group into bricks and
//! numbers the resulting chunks. Chunk indices are persisted (they name the
//! stored chunk objects), so every formula here must stay stable.
//!
//! All voxel coordinates are full resolution (LOD 0) coordinates. At LOD `n`
//! the brick size of every decimated dimension is `brick << n`, and one
//! sample of the chunk buffer covers `1 << n` voxels.

use crate::dimension_group::{DimensionGroup, MAX_DIMENSIONALITY};
use crate::error::{Result, VdsError};

/// Index array for the six possible dimensions
pub type IndexArray = [usize; MAX_DIMENSIONALITY];

/// Number of LOD samples covering the voxels `[voxel_min, voxel_max)`.
///
/// With `include_partial_upper_voxel` a LOD sample that only partly overlaps
/// the upper end of the range is counted.
pub fn lod_size(voxel_min: i64, voxel_max: i64, lod: u32, include_partial_upper_voxel: bool) -> i64 {
    let partial = include_partial_upper_voxel as i64;
    ((voxel_max - partial) >> lod) + partial - (voxel_min >> lod)
}

/// Chunk layout of one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDataPartition {
    lod: u32,
    dimension_group: DimensionGroup,
    num_samples: IndexArray,
    brick_size: IndexArray,
    negative_margin: IndexArray,
    positive_margin: IndexArray,
    lod_decimated: [bool; MAX_DIMENSIONALITY],
    chunks_in_dimension: IndexArray,
    modulo: [u64; MAX_DIMENSIONALITY],
    total_chunks: u64,
}

impl VolumeDataPartition {
    /// Create a partition.
    ///
    /// `brick_size` is the LOD 0 brick size, shifted here for decimated
    /// dimensions. Dimensions outside the group get a brick size of one and
    /// no margins.
    pub fn new(
        lod: u32,
        dimension_group: DimensionGroup,
        num_samples: IndexArray,
        brick_size: IndexArray,
        negative_margin: IndexArray,
        positive_margin: IndexArray,
        lod_decimated: [bool; MAX_DIMENSIONALITY],
    ) -> Result<Self> {
        let mut partition = Self {
            lod,
            dimension_group,
            num_samples,
            brick_size: [1; MAX_DIMENSIONALITY],
            negative_margin: [0; MAX_DIMENSIONALITY],
            positive_margin: [0; MAX_DIMENSIONALITY],
            lod_decimated: [false; MAX_DIMENSIONALITY],
            chunks_in_dimension: [1; MAX_DIMENSIONALITY],
            modulo: [1; MAX_DIMENSIONALITY],
            total_chunks: 1,
        };

        let mut modulo = 1u64;
        for d in 0..MAX_DIMENSIONALITY {
            if num_samples[d] == 0 {
                return Err(VdsError::InvalidArgument(format!(
                    "Dimension {} has no samples",
                    d
                )));
            }

            let chunks = if dimension_group.is_dimension_in_group(d) {
                let decimated = lod_decimated[d];
                let shift = if decimated { lod } else { 0 };
                let brick = brick_size[d]
                    .checked_shl(shift)
                    .filter(|b| *b > 0)
                    .ok_or_else(|| {
                        VdsError::InvalidArgument(format!("Brick size overflow in dimension {}", d))
                    })?
                    .min(num_samples[d]);

                partition.brick_size[d] = brick;
                partition.negative_margin[d] = negative_margin[d];
                partition.positive_margin[d] = positive_margin[d];
                partition.lod_decimated[d] = decimated;

                (num_samples[d] - 1).saturating_sub(negative_margin[d] + positive_margin[d]) / brick
                    + 1
            } else {
                num_samples[d]
            };

            partition.chunks_in_dimension[d] = chunks.max(1);
            partition.modulo[d] = modulo;
            modulo = modulo
                .checked_mul(partition.chunks_in_dimension[d] as u64)
                .ok_or_else(|| VdsError::InvalidArgument("Chunk count overflow".to_string()))?;
        }
        partition.total_chunks = modulo;

        Ok(partition)
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    pub fn dimension_group(&self) -> DimensionGroup {
        self.dimension_group
    }

    pub fn num_samples(&self, dimension: usize) -> usize {
        self.num_samples.get(dimension).copied().unwrap_or(1)
    }

    pub fn num_samples_array(&self) -> &IndexArray {
        &self.num_samples
    }

    /// Brick size in voxels, already scaled for this LOD
    pub fn brick_size(&self, dimension: usize) -> usize {
        self.brick_size.get(dimension).copied().unwrap_or(1)
    }

    pub fn negative_margin(&self, dimension: usize) -> usize {
        self.negative_margin.get(dimension).copied().unwrap_or(0)
    }

    pub fn positive_margin(&self, dimension: usize) -> usize {
        self.positive_margin.get(dimension).copied().unwrap_or(0)
    }

    /// True when one buffer sample along `dimension` covers `1 << lod` voxels
    pub fn is_dimension_lod_decimated(&self, dimension: usize) -> bool {
        self.lod_decimated.get(dimension).copied().unwrap_or(false)
    }

    /// LOD shift applied to `dimension`
    pub fn lod_shift(&self, dimension: usize) -> u32 {
        if self.is_dimension_lod_decimated(dimension) {
            self.lod
        } else {
            0
        }
    }

    pub fn chunks_in_dimension(&self, dimension: usize) -> usize {
        self.chunks_in_dimension.get(dimension).copied().unwrap_or(1)
    }

    pub fn total_chunk_count(&self) -> u64 {
        self.total_chunks
    }

    fn check_chunk(&self, chunk: u64) -> Result<()> {
        if chunk >= self.total_chunks {
            return Err(VdsError::IndexOutOfRange(format!(
                "Chunk {} is out of range, the layer has {} chunks",
                chunk, self.total_chunks
            )));
        }
        Ok(())
    }

    /// Chunk index along `dimension` containing `voxel`
    pub fn voxel_to_index(&self, voxel: usize, dimension: usize) -> usize {
        let voxel = voxel as i64;
        let shifted = if self.dimension_group.is_dimension_in_group(dimension) {
            voxel - self.negative_margin[dimension] as i64
        } else {
            voxel
        };
        let index = shifted.div_euclid(self.brick_size[dimension] as i64);
        index.clamp(0, self.chunks_in_dimension[dimension] as i64 - 1) as usize
    }

    pub fn chunk_index_to_index_array(&self, chunk: u64) -> Result<IndexArray> {
        self.check_chunk(chunk)?;
        let mut remainder = chunk;
        let mut index_array = [0; MAX_DIMENSIONALITY];
        for d in (0..MAX_DIMENSIONALITY).rev() {
            index_array[d] = (remainder / self.modulo[d]) as usize;
            remainder %= self.modulo[d];
        }
        Ok(index_array)
    }

    pub fn index_array_to_chunk_index(&self, index_array: &IndexArray) -> Result<u64> {
        let mut chunk = 0u64;
        for d in 0..MAX_DIMENSIONALITY {
            if index_array[d] >= self.chunks_in_dimension[d] {
                return Err(VdsError::IndexOutOfRange(format!(
                    "Chunk position {} in dimension {} is out of range (0..{})",
                    index_array[d], d, self.chunks_in_dimension[d]
                )));
            }
            chunk += index_array[d] as u64 * self.modulo[d];
        }
        Ok(chunk)
    }

    /// Chunk containing the voxel at `position`
    pub fn chunk_index_from_position(&self, position: &[usize]) -> Result<u64> {
        let mut index_array = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            let voxel = position.get(d).copied().unwrap_or(0);
            if voxel >= self.num_samples[d] {
                return Err(VdsError::IndexOutOfRange(format!(
                    "Voxel {} in dimension {} is outside 0..{}",
                    voxel, d, self.num_samples[d]
                )));
            }
            index_array[d] = self.voxel_to_index(voxel, d);
        }
        self.index_array_to_chunk_index(&index_array)
    }

    /// Voxel bounds `[min, max)` of a chunk.
    ///
    /// Including margins, a chunk starts at its brick boundary and extends by
    /// both margins. Excluding margins, chunks tile the layer without overlap
    /// and the first and last chunks absorb the outer margins.
    pub fn chunk_min_max(&self, chunk: u64, include_margin: bool) -> Result<(IndexArray, IndexArray)> {
        let index_array = self.chunk_index_to_index_array(chunk)?;
        let mut min = [0; MAX_DIMENSIONALITY];
        let mut max = [1; MAX_DIMENSIONALITY];

        for d in 0..MAX_DIMENSIONALITY {
            let index = index_array[d];
            if self.dimension_group.is_dimension_in_group(d) {
                let brick = self.brick_size[d];
                let negative = self.negative_margin[d];
                let positive = self.positive_margin[d];

                let mut lo = index * brick + negative;
                let mut hi = (index + 1) * brick + negative;
                if include_margin || index == 0 {
                    lo -= negative;
                }
                if include_margin || index == self.chunks_in_dimension[d] - 1 {
                    hi += positive;
                }
                min[d] = lo;
                max[d] = hi.min(self.num_samples[d]);
            } else {
                min[d] = index;
                max[d] = index + 1;
            }
        }

        Ok((min, max))
    }

    /// Buffer shape of a chunk in LOD samples, margins included
    pub fn chunk_voxel_shape(&self, chunk: u64) -> Result<IndexArray> {
        let (min, max) = self.chunk_min_max(chunk, true)?;
        let mut shape = [1; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            shape[d] = lod_size(min[d] as i64, max[d] as i64, self.lod_shift(d), true) as usize;
        }
        Ok(shape)
    }

    /// Every chunk whose margin-free area intersects `[min, max)`
    pub fn chunks_in_region(&self, min: &IndexArray, max: &IndexArray) -> Result<Vec<u64>> {
        let mut first = [0; MAX_DIMENSIONALITY];
        let mut last = [0; MAX_DIMENSIONALITY];
        for d in 0..MAX_DIMENSIONALITY {
            if min[d] >= max[d] || max[d] > self.num_samples[d] {
                return Err(VdsError::IndexOutOfRange(format!(
                    "Region {}..{} in dimension {} is empty or outside 0..{}",
                    min[d], max[d], d, self.num_samples[d]
                )));
            }
            first[d] = self.voxel_to_index(min[d], d);
            last[d] = self.voxel_to_index(max[d] - 1, d);
        }

        let mut chunks = Vec::new();
        let mut current = first;
        loop {
            chunks.push(self.index_array_to_chunk_index(&current)?);

            // Dimension 0 varies fastest
            let mut d = 0;
            loop {
                if d == MAX_DIMENSIONALITY {
                    return Ok(chunks);
                }
                if current[d] < last[d] {
                    current[d] += 1;
                    break;
                }
                current[d] = first[d];
                d += 1;
            }
        }
    }

    /// Chunk of `parent` (one LOD up) containing this chunk, and the child
    /// slot of this chunk within it.
    pub fn parent_index(&self, chunk: u64, parent: &VolumeDataPartition) -> Result<(u64, usize)> {
        let mut index_array = self.chunk_index_to_index_array(chunk)?;
        let mut child = 0usize;
        let mut bit = 0;
        for d in self.dimension_group.dimensions() {
            child |= (index_array[d] & 1) << bit;
            bit += 1;
            if self.is_dimension_lod_decimated(d) {
                index_array[d] /= 2;
            }
        }
        Ok((parent.index_array_to_chunk_index(&index_array)?, child))
    }

    /// Chunks of `child_partition` (one LOD down) covered by this chunk
    pub fn child_indices(&self, chunk: u64, child_partition: &VolumeDataPartition) -> Result<Vec<u64>> {
        let index_array = self.chunk_index_to_index_array(chunk)?;
        let dims: Vec<usize> = self.dimension_group.dimensions().collect();

        let mut children = Vec::new();
        'child: for child in 0..(1usize << dims.len()) {
            let mut child_array = index_array;
            for (bit, &d) in dims.iter().enumerate() {
                let offset = (child >> bit) & 1;
                if self.is_dimension_lod_decimated(d) {
                    child_array[d] = index_array[d] * 2 + offset;
                } else if offset == 1 {
                    continue 'child;
                }
                if child_array[d] >= child_partition.chunks_in_dimension(d) {
                    continue 'child;
                }
            }
            children.push(child_partition.index_array_to_chunk_index(&child_array)?);
        }
        Ok(children)
    }

    /// Total number of voxels of the layer at this LOD
    pub fn total_voxels(&self) -> u64 {
        (0..MAX_DIMENSIONALITY)
            .map(|d| lod_size(0, self.num_samples[d] as i64, self.lod_shift(d), true) as u64)
            .product()
    }
}
