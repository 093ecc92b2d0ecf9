//! Dimension groups - canonical ids for subsets of the six volume dimensions
//!
//! Every non-empty subset of `{0, 1, 2, 3, 4, 5}` has exactly one id. Ids are
//! assigned by size first (all 1-subsets, then all 2-subsets, ...) and within
//! one size by lexicographic order of the ascending index tuple, so `01` comes
//! before `02` and `05` before `12`. The tables below are built at compile
//! time and every query is a table lookup.

use crate::error::{Result, VdsError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of dimensions a volume can have
pub const MAX_DIMENSIONALITY: usize = 6;

/// Number of distinct dimension groups
pub const DIMENSION_GROUP_COUNT: usize = 63;

const INVALID_INDEX: u8 = u8::MAX;

const fn build_masks() -> [u8; DIMENSION_GROUP_COUNT] {
    let mut masks = [0u8; DIMENSION_GROUP_COUNT];
    let mut next = 0;
    let mut size = 1;
    while size <= MAX_DIMENSIONALITY {
        let mut combination = [0usize; MAX_DIMENSIONALITY];
        let mut i = 0;
        while i < size {
            combination[i] = i;
            i += 1;
        }
        loop {
            let mut mask = 0u8;
            let mut j = 0;
            while j < size {
                mask |= 1u8 << combination[j];
                j += 1;
            }
            masks[next] = mask;
            next += 1;

            // Advance to the next combination in lexicographic order
            let mut k = size;
            let mut advanced = false;
            while k > 0 {
                k -= 1;
                if combination[k] < MAX_DIMENSIONALITY - size + k {
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
            combination[k] += 1;
            let mut m = k + 1;
            while m < size {
                combination[m] = combination[m - 1] + 1;
                m += 1;
            }
        }
        size += 1;
    }
    masks
}

const fn build_indices(masks: &[u8; DIMENSION_GROUP_COUNT]) -> [u8; 64] {
    let mut indices = [INVALID_INDEX; 64];
    let mut i = 0;
    while i < DIMENSION_GROUP_COUNT {
        indices[masks[i] as usize] = i as u8;
        i += 1;
    }
    indices
}

/// Member dimensions of every group in ascending order, padded with
/// `INVALID_INDEX`
const fn build_members(masks: &[u8; DIMENSION_GROUP_COUNT]) -> [[u8; MAX_DIMENSIONALITY]; DIMENSION_GROUP_COUNT] {
    let mut members = [[INVALID_INDEX; MAX_DIMENSIONALITY]; DIMENSION_GROUP_COUNT];
    let mut group = 0;
    while group < DIMENSION_GROUP_COUNT {
        let mut count = 0;
        let mut dimension = 0;
        while dimension < MAX_DIMENSIONALITY {
            if masks[group] & (1u8 << dimension) != 0 {
                members[group][count] = dimension as u8;
                count += 1;
            }
            dimension += 1;
        }
        group += 1;
    }
    members
}

static GROUP_MASKS: [u8; DIMENSION_GROUP_COUNT] = build_masks();
static GROUP_MEMBERS: [[u8; MAX_DIMENSIONALITY]; DIMENSION_GROUP_COUNT] = build_members(&build_masks());
static MASK_TO_GROUP: [u8; 64] = build_indices(&build_masks());

/// Canonical id of a subset of volume dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DimensionGroup(u8);

impl TryFrom<u8> for DimensionGroup {
    type Error = VdsError;

    fn try_from(index: u8) -> Result<Self> {
        Self::from_index(index as usize)
    }
}

impl From<DimensionGroup> for u8 {
    fn from(group: DimensionGroup) -> u8 {
        group.0
    }
}

impl DimensionGroup {
    /// Group containing only dimension 0
    pub const D0: Self = Self(0);
    /// Group of dimensions 0, 1 and 2
    pub const D012: Self = Self(21);
    /// Group of all six dimensions
    pub const D012345: Self = Self(62);

    /// Build a group from a list of distinct dimension indices.
    pub fn from_indices(indices: &[usize]) -> Result<Self> {
        if indices.is_empty() || indices.len() > MAX_DIMENSIONALITY {
            return Err(VdsError::InvalidArgument(format!(
                "A dimension group needs between 1 and {} dimensions, got {}",
                MAX_DIMENSIONALITY,
                indices.len()
            )));
        }

        let mut mask = 0u8;
        for &index in indices {
            if index >= MAX_DIMENSIONALITY {
                return Err(VdsError::InvalidArgument(format!(
                    "Dimension index {} is out of range",
                    index
                )));
            }
            let bit = 1u8 << index;
            if mask & bit != 0 {
                return Err(VdsError::InvalidArgument(format!(
                    "Dimension index {} appears more than once",
                    index
                )));
            }
            mask |= bit;
        }

        Self::from_mask(mask)
    }

    /// Build a group from a bitmask where bit `d` selects dimension `d`.
    pub fn from_mask(mask: u8) -> Result<Self> {
        let index = MASK_TO_GROUP
            .get(mask as usize)
            .copied()
            .unwrap_or(INVALID_INDEX);
        if index == INVALID_INDEX {
            return Err(VdsError::InvalidArgument(format!(
                "Mask {:#08b} does not describe a dimension group",
                mask
            )));
        }
        Ok(Self(index))
    }

    /// Look up a group by its canonical id.
    pub fn from_index(index: usize) -> Result<Self> {
        if index >= DIMENSION_GROUP_COUNT {
            return Err(VdsError::IndexOutOfRange(format!(
                "Dimension group id {} is out of range",
                index
            )));
        }
        Ok(Self(index as u8))
    }

    /// Canonical id of this group
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Bitmask of the member dimensions
    pub fn mask(self) -> u8 {
        GROUP_MASKS[self.0 as usize]
    }

    /// Number of dimensions in the group
    pub fn dimensionality(self) -> usize {
        self.mask().count_ones() as usize
    }

    /// The `i`-th member dimension in ascending order.
    pub fn dimension(self, i: usize) -> Result<usize> {
        match GROUP_MEMBERS[self.0 as usize].get(i) {
            Some(&dimension) if dimension != INVALID_INDEX => Ok(dimension as usize),
            _ => Err(VdsError::IndexOutOfRange(format!(
                "Dimension {} requested from {} which has {} dimensions",
                i,
                self,
                self.dimensionality()
            ))),
        }
    }

    pub fn is_dimension_in_group(self, dimension: usize) -> bool {
        dimension < MAX_DIMENSIONALITY && self.mask() & (1u8 << dimension) != 0
    }

    /// Smallest group containing the dimensions of both groups.
    pub fn union(self, other: Self) -> Result<Self> {
        Self::from_mask(self.mask() | other.mask())
    }

    /// True when data laid out for `self` can be reinterpreted as `other`
    /// without copying, i.e. when every dimension of `self` is in `other`.
    pub fn is_remapping_possible(self, other: Self) -> bool {
        self.mask() & !other.mask() == 0
    }

    /// Member dimensions in ascending order
    pub fn dimensions(self) -> impl Iterator<Item = usize> {
        GROUP_MEMBERS[self.0 as usize]
            .into_iter()
            .take_while(|&d| d != INVALID_INDEX)
            .map(usize::from)
    }

    /// All groups in canonical order
    pub fn iter() -> impl Iterator<Item = DimensionGroup> {
        (0..DIMENSION_GROUP_COUNT as u8).map(DimensionGroup)
    }
}

impl fmt::Display for DimensionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dimensions_")?;
        for d in self.dimensions() {
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}
