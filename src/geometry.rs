//! Level and tree-index arithmetic.
//!
//! Every block a region can hand out is a node in an implicit complete binary
//! tree. Level 0 is the whole region and each deeper level halves the block
//! size. Nodes are numbered breadth-first from zero, so the node for the block
//! at offset `ofs` on level `l` is `(1 << l) + (ofs >> (total_levels - l)) - 1`.

use crate::AllocInitError;

/// The shape of the tree over one region.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Size of the region in bytes.
    pub region_size: usize,
    /// Size of the smallest block in bytes.
    pub min_allocation: usize,
    /// `log2(region_size)`.
    pub total_levels: usize,
    /// The deepest level, whose blocks are `min_allocation` bytes.
    pub max_level: usize,
    /// Number of bits needed to describe every node, `2 ^ (max_level + 1)`.
    pub max_indexes: usize,
}

impl Geometry {
    /// Computes the geometry of a region of `region_size` bytes split down to
    /// blocks of `min_allocation` bytes.
    ///
    /// `min_allocation` is assumed to be a power of two.
    pub fn new(region_size: usize, min_allocation: usize) -> Result<Geometry, AllocInitError> {
        debug_assert!(min_allocation.is_power_of_two());

        if !region_size.is_power_of_two() {
            return Err(AllocInitError::NotPowerOfTwo { size: region_size });
        }

        if region_size < min_allocation {
            return Err(AllocInitError::TooSmall {
                size: region_size,
                min: min_allocation,
            });
        }

        let total_levels = region_size.trailing_zeros() as usize;
        let max_level = total_levels - min_allocation.trailing_zeros() as usize;

        // One bit per node for the split plane, one per sibling pair for the
        // allocation plane; both fit in twice the leaf count.
        let max_indexes = 1_usize
            .checked_shl((max_level + 1) as u32)
            .filter(|&n| n != 0)
            .ok_or(AllocInitError::TooSmall {
                size: region_size,
                min: min_allocation,
            })?;

        Ok(Geometry {
            region_size,
            min_allocation,
            total_levels,
            max_level,
            max_indexes,
        })
    }

    /// Returns the size of each block on `level`.
    #[inline]
    pub fn block_size(&self, level: usize) -> usize {
        debug_assert!(level <= self.max_level);
        self.region_size >> level
    }

    /// Returns the level whose blocks are the smallest that can hold `size`
    /// bytes.
    ///
    /// Requests below the minimum granularity land on `max_level`. Returns
    /// `None` if `size` exceeds the region.
    pub fn size_to_level(&self, size: usize) -> Option<usize> {
        if size <= self.min_allocation {
            return Some(self.max_level);
        }

        if size > self.region_size {
            return None;
        }

        let rounded = size.checked_next_power_of_two()?;
        Some(self.total_levels - rounded.trailing_zeros() as usize)
    }

    /// Returns the node index of the block at `offset` on `level`.
    #[inline]
    pub fn index_of(&self, offset: usize, level: usize) -> usize {
        debug_assert!(level <= self.max_level);
        debug_assert_eq!(offset % self.block_size(level), 0, "misaligned block");

        (1 << level) + (offset >> (self.total_levels - level)) - 1
    }

    /// Returns the offset of the buddy of the block at `offset` on `level`.
    #[inline]
    pub fn buddy_of(&self, offset: usize, level: usize) -> usize {
        offset ^ self.block_size(level)
    }

    /// Returns the index of the parent of node `index`.
    #[inline]
    pub fn parent(index: usize) -> usize {
        debug_assert!(index > 0, "the root has no parent");
        (index - 1) >> 1
    }

    /// Returns the bit holding the allocation state of the pair that node
    /// `index` belongs to.
    #[inline]
    pub fn allocation_bit(index: usize) -> usize {
        debug_assert!(index > 0, "the root has no allocation bit");
        (index - 1) >> 1
    }

    /// Returns the bit holding the split state of node `index`.
    #[inline]
    pub fn split_bit(&self, index: usize) -> usize {
        index + self.max_indexes / 2
    }
}
