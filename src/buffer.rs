//! Typed voxel buffers
//!
//! A [`PageBuffer`] stores a dense box of voxels with dimension 0 varying
//! fastest. The backing store is a `Vec<u64>` so that every supported
//! element type can be viewed in place through `bytemuck`.

use crate::dimension_group::MAX_DIMENSIONALITY;
use crate::error::{Result, VdsError};
use crate::partition::IndexArray;
use crate::types::{Components, Format};
use bytemuck::Pod;
use ndarray::{ArrayViewD, ArrayViewMutD, IxDyn, ShapeBuilder};

/// Element types a buffer can be viewed as
pub trait VoxelValue: Pod + num_traits::NumCast + PartialEq + std::fmt::Debug {
    const FORMAT: Format;
}

macro_rules! impl_voxel_value {
    ($($t:ty => $format:expr),*) => {
        $(impl VoxelValue for $t {
            const FORMAT: Format = $format;
        })*
    };
}

impl_voxel_value!(
    u8 => Format::U8,
    u16 => Format::U16,
    u32 => Format::U32,
    u64 => Format::U64,
    f32 => Format::R32,
    f64 => Format::R64
);

/// Dense voxel buffer of one format
#[derive(Clone, PartialEq)]
pub struct PageBuffer {
    words: Vec<u64>,
    len: usize,
    format: Format,
    components: Components,
    shape: IndexArray,
}

impl PageBuffer {
    /// Zero-filled buffer of the given shape
    pub fn zeroed(format: Format, components: Components, shape: IndexArray) -> Self {
        let voxels: usize = shape.iter().product();
        let len = format.buffer_size(voxels, components);
        Self {
            words: vec![0u64; (len + 7) / 8],
            len,
            format,
            components,
            shape,
        }
    }

    /// Buffer holding a copy of `bytes`, which must have the exact size
    pub fn from_bytes(format: Format, components: Components, shape: IndexArray, bytes: &[u8]) -> Result<Self> {
        let mut buffer = Self::zeroed(format, components, shape);
        if bytes.len() != buffer.len {
            return Err(VdsError::Codec(format!(
                "Expected {} bytes for a {:?} buffer of {:?}, got {}",
                buffer.len, format, shape, bytes.len()
            )));
        }
        buffer.as_bytes_mut().copy_from_slice(bytes);
        Ok(buffer)
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn components(&self) -> Components {
        self.components
    }

    pub fn shape(&self) -> &IndexArray {
        &self.shape
    }

    pub fn voxel_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Distance in voxels between neighbours along each dimension
    pub fn pitch(&self) -> IndexArray {
        let mut pitch = [0; MAX_DIMENSIONALITY];
        let mut stride = 1;
        for d in 0..MAX_DIMENSIONALITY {
            pitch[d] = stride;
            stride *= self.shape[d];
        }
        pitch
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }

    fn check_type<T: VoxelValue>(&self) -> Result<()> {
        if T::FORMAT != self.format {
            return Err(VdsError::InvalidArgument(format!(
                "Buffer holds {} values, not {}",
                self.format,
                T::FORMAT
            )));
        }
        Ok(())
    }

    /// All components of all voxels as a typed slice
    pub fn as_slice<T: VoxelValue>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|e| VdsError::InvalidArgument(e.to_string()))
    }

    pub fn as_mut_slice<T: VoxelValue>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|e| VdsError::InvalidArgument(e.to_string()))
    }

    fn view_shape(&self) -> (Vec<usize>, Vec<usize>) {
        let components = self.components.count();
        let mut shape: Vec<usize> = self.shape.to_vec();
        let mut strides: Vec<usize> = self.pitch().iter().map(|p| p * components).collect();
        if components > 1 {
            shape.push(components);
            strides.push(1);
        }
        (shape, strides)
    }

    /// Six dimensional view, indexed `[d0, d1, ..., d5]` (plus a component
    /// axis for multi-component formats)
    pub fn view<T: VoxelValue>(&self) -> Result<ArrayViewD<'_, T>> {
        let (shape, strides) = self.view_shape();
        let data = self.as_slice::<T>()?;
        ArrayViewD::from_shape(IxDyn(&shape).strides(IxDyn(&strides)), data)
            .map_err(|e| VdsError::InvalidArgument(e.to_string()))
    }

    pub fn view_mut<T: VoxelValue>(&mut self) -> Result<ArrayViewMutD<'_, T>> {
        let (shape, strides) = self.view_shape();
        let data = self.as_mut_slice::<T>()?;
        ArrayViewMutD::from_shape(IxDyn(&shape).strides(IxDyn(&strides)), data)
            .map_err(|e| VdsError::InvalidArgument(e.to_string()))
    }

    fn linear_index(&self, position: &IndexArray) -> usize {
        let pitch = self.pitch();
        (0..MAX_DIMENSIONALITY).map(|d| position[d] * pitch[d]).sum()
    }

    /// Read one bit of a `OneBit` buffer
    pub fn bit(&self, position: &IndexArray) -> bool {
        let index = self.linear_index(position);
        self.as_bytes()[index / 8] & (1 << (index % 8)) != 0
    }

    /// Write one bit of a `OneBit` buffer
    pub fn set_bit(&mut self, position: &IndexArray, value: bool) {
        let index = self.linear_index(position);
        let byte = &mut self.as_bytes_mut()[index / 8];
        if value {
            *byte |= 1 << (index % 8);
        } else {
            *byte &= !(1 << (index % 8));
        }
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer")
            .field("format", &self.format)
            .field("components", &self.components)
            .field("shape", &self.shape)
            .finish()
    }
}

/// Copy the box of `size` voxels at `src_origin` in `src` to `dst_origin`
/// in `dst`. Both buffers must share format and component count.
pub fn copy_region(
    src: &PageBuffer,
    src_origin: &IndexArray,
    dst: &mut PageBuffer,
    dst_origin: &IndexArray,
    size: &IndexArray,
) -> Result<()> {
    if src.format != dst.format || src.components != dst.components {
        return Err(VdsError::InvalidArgument(format!(
            "Cannot copy {} x{} voxels into a {} x{} buffer",
            src.format,
            src.components.count(),
            dst.format,
            dst.components.count()
        )));
    }
    for d in 0..MAX_DIMENSIONALITY {
        if src_origin[d] + size[d] > src.shape[d] || dst_origin[d] + size[d] > dst.shape[d] {
            return Err(VdsError::IndexOutOfRange(format!(
                "Copy of {} voxels in dimension {} does not fit ({}+{} of {}, {}+{} of {})",
                size[d], d, src_origin[d], size[d], src.shape[d], dst_origin[d], size[d], dst.shape[d]
            )));
        }
    }
    if size.iter().any(|s| *s == 0) {
        return Ok(());
    }

    let voxel_bytes = src.format.size_in_bytes().map(|s| s * src.components.count());
    let mut offset = [0usize; MAX_DIMENSIONALITY];
    loop {
        let mut from = *src_origin;
        let mut to = *dst_origin;
        for d in 1..MAX_DIMENSIONALITY {
            from[d] += offset[d];
            to[d] += offset[d];
        }

        match voxel_bytes {
            Some(voxel_bytes) => {
                let start = src.linear_index(&from) * voxel_bytes;
                let target = dst.linear_index(&to) * voxel_bytes;
                let row = size[0] * voxel_bytes;
                dst.as_bytes_mut()[target..target + row]
                    .copy_from_slice(&src.as_bytes()[start..start + row]);
            }
            None => {
                // Bits are copied one voxel (and component) at a time
                let components = src.components.count();
                for i in 0..size[0] {
                    let mut a = from;
                    let mut b = to;
                    a[0] += i;
                    b[0] += i;
                    let a = src.linear_index(&a) * components;
                    let b = dst.linear_index(&b) * components;
                    for c in 0..components {
                        let bit = src.as_bytes()[(a + c) / 8] & (1 << ((a + c) % 8)) != 0;
                        let byte = &mut dst.as_bytes_mut()[(b + c) / 8];
                        if bit {
                            *byte |= 1 << ((b + c) % 8);
                        } else {
                            *byte &= !(1 << ((b + c) % 8));
                        }
                    }
                }
            }
        }

        let mut d = 1;
        loop {
            if d == MAX_DIMENSIONALITY {
                return Ok(());
            }
            offset[d] += 1;
            if offset[d] < size[d] {
                break;
            }
            offset[d] = 0;
            d += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut buffer = PageBuffer::zeroed(Format::R32, Components::One, [4, 3, 2, 1, 1, 1]);
        assert_eq!(buffer.as_bytes().len(), 4 * 3 * 2 * 4);
        assert_eq!(buffer.pitch(), [1, 4, 12, 24, 24, 24]);

        buffer.as_mut_slice::<f32>().unwrap()[5] = 2.5;
        let view = buffer.view::<f32>().unwrap();
        assert_eq!(view[[1, 1, 0, 0, 0, 0]], 2.5);
        assert!(buffer.as_slice::<u8>().is_err());
    }

    #[test]
    fn test_multi_component_view() {
        let mut buffer = PageBuffer::zeroed(Format::U16, Components::Two, [2, 2, 1, 1, 1, 1]);
        buffer.as_mut_slice::<u16>().unwrap()[3] = 7;
        let view = buffer.view::<u16>().unwrap();
        assert_eq!(view.shape(), &[2, 2, 1, 1, 1, 1, 2]);
        assert_eq!(view[[1, 0, 0, 0, 0, 0, 1]], 7);
    }

    #[test]
    fn test_copy_region() {
        let mut src = PageBuffer::zeroed(Format::U8, Components::One, [4, 4, 1, 1, 1, 1]);
        for (i, v) in src.as_mut_slice::<u8>().unwrap().iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut dst = PageBuffer::zeroed(Format::U8, Components::One, [3, 3, 1, 1, 1, 1]);
        copy_region(&src, &[1, 1, 0, 0, 0, 0], &mut dst, &[0, 1, 0, 0, 0, 0], &[2, 2, 1, 1, 1, 1]).unwrap();
        assert_eq!(dst.as_slice::<u8>().unwrap(), &[0, 0, 0, 5, 6, 0, 9, 10, 0]);

        assert!(matches!(
            copy_region(&src, &[3, 0, 0, 0, 0, 0], &mut dst, &[0, 0, 0, 0, 0, 0], &[2, 1, 1, 1, 1, 1]),
            Err(VdsError::IndexOutOfRange(_))
        ));
    }

    #[test]
    fn test_bit_buffers() {
        let mut src = PageBuffer::zeroed(Format::OneBit, Components::One, [10, 2, 1, 1, 1, 1]);
        assert_eq!(src.as_bytes().len(), 3);
        src.set_bit(&[3, 1, 0, 0, 0, 0], true);
        src.set_bit(&[9, 0, 0, 0, 0, 0], true);

        let mut dst = PageBuffer::zeroed(Format::OneBit, Components::One, [5, 2, 1, 1, 1, 1]);
        copy_region(&src, &[2, 0, 0, 0, 0, 0], &mut dst, &[0, 0, 0, 0, 0, 0], &[5, 2, 1, 1, 1, 1]).unwrap();
        assert!(dst.bit(&[1, 1, 0, 0, 0, 0]));
        assert!(!dst.bit(&[1, 0, 0, 0, 0, 0]));
        assert!(!dst.bit(&[4, 0, 0, 0, 0, 0]));
    }
}
