use core::{alloc::Layout, mem};

use crate::geometry::Geometry;

/// A packed bit vector backed by `u64` words the bitmap does not own.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of the words backing a bitmap of `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u64>(Self::num_blocks(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with every
    /// bit cleared.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for `Bitmap::num_blocks(num_bits)
    ///   * mem::size_of::<u64>()` many bytes, and it must be properly aligned.
    /// - No other live `Bitmap` may be backed by the same words.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        let bitmap = unsafe { Bitmap::from_raw(num_bits, map) };

        for i in 0..Self::num_blocks(num_bits) {
            unsafe { map.add(i).write(0) };
        }

        bitmap
    }

    /// Constructs a bitmap over words that already hold bits, leaving them as
    /// they are.
    ///
    /// # Safety
    ///
    /// Same as [`Bitmap::new`], and additionally the words must be
    /// initialized.
    pub unsafe fn from_raw(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        Bitmap { num_bits, map }
    }

    #[inline]
    pub fn num_blocks(num_bits: usize) -> usize {
        num_bits.div_ceil(u64::BITS as usize)
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Applies `f` to the word holding `bit` and returns the updated word
    /// masked down to that bit.
    #[inline]
    fn update(&mut self, bit: usize, f: impl FnOnce(u64, u64) -> u64) -> bool {
        assert!(bit < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(bit);

        // SAFETY: `block_idx < num_blocks(num_bits)` because `bit < num_bits`.
        unsafe {
            let block_ptr = self.map.add(block_idx);
            let block = f(block_ptr.read(), mask);
            block_ptr.write(block);
            block & mask != 0
        }
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        assert!(bit < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(bit);

        unsafe { self.map.add(block_idx).read() & mask != 0 }
    }

    /// Sets the indexed bit.
    #[inline]
    pub fn set(&mut self, bit: usize) {
        self.update(bit, |block, mask| block | mask);
    }

    /// Clears the indexed bit.
    #[inline]
    pub fn clear(&mut self, bit: usize) {
        self.update(bit, |block, mask| block & !mask);
    }

    /// Toggles the indexed bit, returning its new value.
    #[inline]
    pub fn toggle(&mut self, bit: usize) -> bool {
        self.update(bit, |block, mask| block ^ mask)
    }
}

/// The split and allocation planes of the buddy tree, packed into one bitmap.
///
/// The lower half of the bitmap holds one allocation bit per sibling pair: it
/// is set while exactly one of the two siblings is free. The upper half holds
/// one split bit per node above the deepest level.
pub struct TreeBits {
    bits: Bitmap,
    geometry: Geometry,
}

impl TreeBits {
    /// Wraps `bits`, which must hold `geometry.max_indexes` bits.
    pub fn new(bits: Bitmap, geometry: Geometry) -> TreeBits {
        assert_eq!(bits.num_bits, geometry.max_indexes);

        TreeBits { bits, geometry }
    }

    /// Returns whether node `index` has been divided into two live children.
    #[inline]
    pub fn is_split(&self, index: usize) -> bool {
        self.bits.is_set(self.split_bit(index))
    }

    #[inline]
    pub fn set_split(&mut self, index: usize) {
        let bit = self.split_bit(index);
        self.bits.set(bit);
    }

    #[inline]
    pub fn clear_split(&mut self, index: usize) {
        let bit = self.split_bit(index);
        self.bits.clear(bit);
    }

    /// Records that node `index` moved between the free and in-use states.
    ///
    /// Returns the new value of the pair's allocation bit.
    #[inline]
    pub fn toggle_allocated(&mut self, index: usize) -> bool {
        self.bits.toggle(Geometry::allocation_bit(index))
    }

    /// Returns whether the buddy of node `index` is in use, assuming node
    /// `index` itself is free.
    #[cfg(test)]
    pub fn is_buddy_allocated(&self, index: usize) -> bool {
        self.bits.is_set(Geometry::allocation_bit(index))
    }

    fn split_bit(&self, index: usize) -> usize {
        debug_assert!(
            index < (1 << self.geometry.max_level) - 1,
            "blocks on the deepest level cannot be split"
        );
        self.geometry.split_bit(index)
    }
}
