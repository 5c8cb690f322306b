//! A binary-buddy allocator hosted inside the region it manages.
//!
//! The front of the region holds a header, one free-list head per level and
//! the tree bitmap. That span is marked allocated in the tree during
//! construction, so the allocator never hands it out.

use core::{alloc::Layout, fmt, mem, ptr::NonNull};

#[cfg(test)]
use alloc::vec::Vec;

#[allow(unused_imports)]
use sptr::Strict;

use crate::{
    base::{BasePtr, FreeLink},
    bitmap::{Bitmap, TreeBits},
    geometry::Geometry,
    list::{self, FreeList},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// Marks the front of a region that holds metadata written by this module.
const HEADER_MAGIC: usize = 0x4255_4459;

const LINK_SIZE: usize = mem::size_of::<FreeLink>();

/// The scalar part of the self-hosted metadata.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct Header {
    magic: usize,
    geometry: Geometry,
    /// Offset of the free-list heads from the header.
    heads: usize,
    /// Offset of the tree bitmap from the header.
    bits: usize,
    /// Bytes at the front of the region held by the metadata. Zero in the
    /// temporary copy used while bootstrapping.
    reserved: usize,
}

/// Where each part of the metadata sits relative to the header.
#[derive(Copy, Clone, Debug)]
struct MetaLayout {
    heads: usize,
    bits: usize,
    size: usize,
}

impl MetaLayout {
    fn new(geometry: &Geometry) -> Option<MetaLayout> {
        let heads = Layout::array::<FreeLink>(geometry.max_level + 1).ok()?;
        let bits = Bitmap::map_layout(geometry.max_indexes);

        let (layout, heads_ofs) = Layout::new::<Header>().extend(heads).ok()?;
        let (layout, bits_ofs) = layout.extend(bits).ok()?;

        Some(MetaLayout {
            heads: heads_ofs,
            bits: bits_ofs,
            size: layout.pad_to_align().size(),
        })
    }

    /// Returns the number of bytes reserved for the metadata once it is
    /// rounded up to whole minimum-size blocks.
    fn reserved(&self, geometry: &Geometry) -> usize {
        self.size.next_multiple_of(geometry.min_allocation)
    }
}

fn check_min_allocation(min: usize) -> Result<(), AllocInitError> {
    if !min.is_power_of_two() || min < LINK_SIZE || min < mem::align_of::<u64>() {
        return Err(AllocInitError::InvalidMinAllocation { min });
    }

    Ok(())
}

fn check_alignment(region: NonNull<u8>, min: usize) -> Result<(), AllocInitError> {
    if region.as_ptr().addr() % min != 0 {
        return Err(AllocInitError::Misaligned { align: min });
    }

    Ok(())
}

/// The allocator state, without a `Drop` impl or an associated backing
/// allocator.
///
/// Every field is derived from the header at `meta`; the region itself is the
/// only place any state lives.
struct RawBuddy {
    base: BasePtr,
    geometry: Geometry,
    /// Offset of the metadata header.
    meta: usize,
    /// Offset of the level-0 free-list head.
    heads: usize,
    bits: TreeBits,
    reserved: usize,
}

impl RawBuddy {
    /// Constructs an allocator over `size` bytes at `region`, placing its
    /// metadata inside the region.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `size` bytes and must
    /// not be used by anything else for the lifetime of the allocator.
    unsafe fn create(
        region: NonNull<u8>,
        size: usize,
        min: usize,
    ) -> Result<RawBuddy, AllocInitError> {
        check_min_allocation(min)?;
        check_alignment(region, min)?;

        let geometry = Geometry::new(size, min)?;
        let base = BasePtr::new(region, size);

        unsafe { RawBuddy::bootstrap(base, geometry) }
    }

    /// Builds the allocator so that its metadata occupies the front of the
    /// region and is marked allocated in its own tree.
    ///
    /// A temporary copy of the metadata is written at the tail of the region
    /// and manages the whole region. Minimum-size blocks are then allocated
    /// from it until the front of the region covers the metadata footprint,
    /// and the metadata is moved there.
    unsafe fn bootstrap(base: BasePtr, geometry: Geometry) -> Result<RawBuddy, AllocInitError> {
        let size = geometry.region_size;

        let layout = MetaLayout::new(&geometry).ok_or(AllocInitError::MetadataTooLarge {
            size,
            metadata: usize::MAX,
        })?;
        let reserved = layout.reserved(&geometry);

        // The tail copy must not overlap the front copy, and the block
        // starting halfway through the region (the first right half split
        // off while reserving) must not have its link land in the tail copy.
        if reserved >= size / 2 {
            return Err(AllocInitError::MetadataTooLarge {
                size,
                metadata: reserved,
            });
        }

        let tail = size - layout.size;
        let mut temp = unsafe { RawBuddy::init(base, geometry, layout, tail) };

        // A tree in which only the front has been carved up always hands out
        // the lowest free minimum-size block next.
        for expected in (0..reserved).step_by(geometry.min_allocation) {
            let block = temp.allocate_level(geometry.max_level);
            assert_eq!(block, Some(expected), "bootstrap reservation out of order");
        }

        let buddy = unsafe { temp.relocate(layout, 0, reserved) };

        // The list heads were rewired in place, so no free block may lie in
        // the span now holding the metadata.
        assert!(
            buddy.free_blocks().all(|(_, block)| block >= reserved),
            "metadata span is on a free list"
        );

        log::debug!(
            "buddy: {size} byte region at {:p}, levels 0..={}, {reserved} bytes of metadata",
            base.ptr(),
            geometry.max_level,
        );

        Ok(buddy)
    }

    /// Writes fresh metadata at `meta` describing a region whose every byte is
    /// free.
    ///
    /// # Safety
    ///
    /// `meta..meta + layout.size` must lie inside the region, be aligned for
    /// `Header`, and not contain offset 0.
    unsafe fn init(base: BasePtr, geometry: Geometry, layout: MetaLayout, meta: usize) -> RawBuddy {
        debug_assert!(meta >= LINK_SIZE && meta + layout.size <= geometry.region_size);

        let header = Header {
            magic: HEADER_MAGIC,
            geometry,
            heads: layout.heads,
            bits: layout.bits,
            reserved: 0,
        };

        unsafe {
            base.with_offset(meta)
                .cast::<Header>()
                .as_ptr()
                .write(header);

            for level in 0..=geometry.max_level {
                FreeList::init(base, meta + layout.heads + level * LINK_SIZE);
            }

            let map = base.with_offset(meta + layout.bits).cast::<u64>().as_ptr();
            Bitmap::new(geometry.max_indexes, map);

            let buddy = RawBuddy::from_header(base, meta, header);
            buddy.free_list(0).push(base, 0);

            buddy
        }
    }

    /// Re-attaches to a region whose front holds metadata written by
    /// [`RawBuddy::create`].
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads of a `Header`. If a valid header is
    /// found, the whole region it describes must be valid for reads and writes
    /// and must not be used by anything else for the lifetime of the
    /// allocator.
    unsafe fn attach(region: NonNull<u8>, min: usize) -> Result<RawBuddy, AllocInitError> {
        check_min_allocation(min)?;
        check_alignment(region, min)?;

        let header = unsafe { region.cast::<Header>().as_ptr().read() };
        if header.magic != HEADER_MAGIC {
            return Err(AllocInitError::InvalidHeader);
        }

        let geometry = Geometry::new(header.geometry.region_size, min)
            .map_err(|_| AllocInitError::InvalidHeader)?;
        let layout = MetaLayout::new(&geometry).ok_or(AllocInitError::InvalidHeader)?;

        if header.geometry != geometry
            || header.heads != layout.heads
            || header.bits != layout.bits
            || header.reserved != layout.reserved(&geometry)
        {
            return Err(AllocInitError::InvalidHeader);
        }

        let base = BasePtr::new(region, geometry.region_size);

        Ok(unsafe { RawBuddy::from_header(base, 0, header) })
    }

    /// # Safety
    ///
    /// `header` must describe initialized metadata located at `meta`.
    unsafe fn from_header(base: BasePtr, meta: usize, header: Header) -> RawBuddy {
        let geometry = header.geometry;
        debug_assert_eq!(base.extent(), geometry.region_size);

        let map = base.with_offset(meta + header.bits).cast::<u64>().as_ptr();
        let bits = unsafe { Bitmap::from_raw(geometry.max_indexes, map) };

        RawBuddy {
            base,
            geometry,
            meta,
            heads: meta + header.heads,
            bits: TreeBits::new(bits, geometry),
            reserved: header.reserved,
        }
    }

    /// Moves the metadata to `meta` and records `reserved` bytes as held by
    /// it.
    ///
    /// # Safety
    ///
    /// `meta..meta + layout.size` must lie inside the region, must not overlap
    /// the current metadata, and must not contain any free block.
    unsafe fn relocate(self, layout: MetaLayout, meta: usize, reserved: usize) -> RawBuddy {
        let base = self.base;

        unsafe {
            base.copy_nonoverlapping(self.meta, meta, layout.size);

            // Only the links pointing at a head record change; links between
            // free blocks are offsets into the region and stay valid.
            for level in 0..=self.geometry.max_level {
                let old = self.heads + level * LINK_SIZE;
                FreeList::at(meta + layout.heads + level * LINK_SIZE).adopt(base, old);
            }

            let header = base.with_offset(meta).cast::<Header>().as_ptr();
            (*header).reserved = reserved;

            RawBuddy::from_header(base, meta, header.read())
        }
    }

    #[inline]
    fn free_list(&self, level: usize) -> FreeList {
        debug_assert!(level <= self.geometry.max_level);
        FreeList::at(self.heads + level * LINK_SIZE)
    }

    /// Allocates a block on `target`, splitting a larger block if necessary.
    ///
    /// Returns the offset of the block, or `None` if no block on `target` or
    /// above it is free.
    fn allocate_level(&mut self, target: usize) -> Option<usize> {
        let base = self.base;

        // Scan increasing block sizes until a free block is found.
        let init_level = (0..=target)
            .rev()
            .find(|&level| unsafe { !self.free_list(level).is_empty(base) })?;

        let block = unsafe { self.free_list(init_level).pop_front(base)? };
        let mut index = self.geometry.index_of(block, init_level);
        if init_level > 0 {
            self.bits.toggle_allocated(index);
        }

        // Split the block repeatedly. The address of the front half does not
        // change; the back half goes onto the next level's free list.
        for level in init_level..target {
            self.bits.set_split(index);

            let back_half = block + self.geometry.block_size(level + 1);
            unsafe { self.free_list(level + 1).push(base, back_half) };

            index = self.geometry.index_of(block, level + 1);
            self.bits.toggle_allocated(index);
        }

        Some(block)
    }

    /// Returns the level `block` was allocated on, found from the split bits
    /// of its ancestors.
    ///
    /// The nearest split ancestor of the deepest node covering `block` is the
    /// parent of the allocated block.
    fn level_of(&self, block: usize) -> usize {
        let mut level = self.geometry.max_level;
        let mut index = self.geometry.index_of(block, level);

        while index > 0 {
            let parent = Geometry::parent(index);
            if self.bits.is_split(parent) {
                return level;
            }

            index = parent;
            level -= 1;
        }

        0
    }

    /// Returns the allocated block at `block` on `level` to the free lists,
    /// merging it with its buddy for as long as the buddy is free.
    ///
    /// # Safety
    ///
    /// `block` must be currently allocated on `level`.
    unsafe fn coalesce(&mut self, mut block: usize, mut level: usize) {
        let base = self.base;
        let mut index = self.geometry.index_of(block, level);

        while level > 0 {
            // The pair bit is left set if the buddy is still in use.
            if self.bits.toggle_allocated(index) {
                break;
            }

            let buddy = self.geometry.buddy_of(block, level);
            unsafe { FreeList::remove(base, buddy) };

            index = Geometry::parent(index);
            self.bits.clear_split(index);

            // The merged block starts at the lower buddy.
            block &= !self.geometry.block_size(level);
            level -= 1;
        }

        if level < self.geometry.max_level {
            self.bits.clear_split(index);
        }

        unsafe { self.free_list(level).push(base, block) };
    }

    /// Returns an iterator over `(level, offset)` of every free block.
    fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..=self.geometry.max_level).flat_map(move |level| {
            // SAFETY: the lists are not modified while `self` is borrowed.
            let iter: list::Iter = unsafe { self.free_list(level).iter(self.base) };
            iter.map(move |block| (level, block))
        })
    }

    fn largest_available(&self) -> usize {
        (0..=self.geometry.max_level)
            .find(|&level| unsafe { !self.free_list(level).is_empty(self.base) })
            .map_or(0, |level| self.geometry.block_size(level))
    }

    fn available(&self) -> usize {
        self.free_blocks()
            .map(|(level, _)| self.geometry.block_size(level))
            .sum()
    }
}

/// A binary-buddy allocator over one power-of-two region.
///
/// This takes two parameters:
/// - `MIN_ALLOC` is the size of the smallest block. It must be a power of two
///   and at least two machine words; [`DEFAULT_MIN_ALLOCATION`] is the
///   smallest valid value.
/// - `A` is the backing allocator that owns the region, [`Raw`] or
///   [`Global`](crate::Global).
///
/// The allocator stores its header, per-level free-list heads and tree bitmap
/// at the front of the region; [`Buddy::metadata_size`] reports how many bytes
/// that takes. The rest of the region is available to callers.
///
/// The allocator performs no synchronization. It may be moved to another
/// thread, but concurrent use requires an external lock.
///
/// [`DEFAULT_MIN_ALLOCATION`]: crate::DEFAULT_MIN_ALLOCATION
pub struct Buddy<const MIN_ALLOC: usize, A: BackingAllocator> {
    raw: RawBuddy,
    backing_allocator: A,
}

// SAFETY: the allocator exclusively owns its region and holds no references to
// thread-local state.
unsafe impl<const MIN_ALLOC: usize, A: BackingAllocator + Send> Send for Buddy<MIN_ALLOC, A> {}

impl<const MIN_ALLOC: usize> Buddy<MIN_ALLOC, Raw> {
    /// Constructs a new `Buddy` over `size` bytes at `region`.
    ///
    /// The allocator's metadata is placed inside the region itself.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is not a power of two, is smaller than
    /// `MIN_ALLOC`, or is too small to host the metadata, if `MIN_ALLOC` is
    /// invalid, or if `region` is not aligned to `MIN_ALLOC`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `size` bytes.
    /// - The memory at `region` must not be accessed except through the
    ///   returned allocator and the blocks it hands out, until the allocator
    ///   is dropped or decomposed with [`Buddy::into_raw_parts`].
    pub unsafe fn new_raw(region: NonNull<u8>, size: usize) -> Result<Self, AllocInitError> {
        let raw = unsafe { RawBuddy::create(region, size, MIN_ALLOC)? };

        Ok(Buddy {
            raw,
            backing_allocator: Raw,
        })
    }

    /// Reconstructs an allocator from a region previously decomposed with
    /// [`Buddy::into_raw_parts`].
    ///
    /// Blocks that were allocated when the allocator was decomposed are still
    /// allocated.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidHeader`] if the front of the region
    /// does not hold metadata for an allocator with this `MIN_ALLOC`.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads of at least `MIN_ALLOC` bytes. If it
    /// holds metadata written by this crate, the region it describes must
    /// satisfy the requirements of [`Buddy::new_raw`], and no other allocator
    /// may be attached to it.
    pub unsafe fn from_raw_parts(region: NonNull<u8>) -> Result<Self, AllocInitError> {
        let raw = unsafe { RawBuddy::attach(region, MIN_ALLOC)? };

        log::debug!(
            "buddy: reattached {} byte region at {:p}",
            raw.geometry.region_size,
            region
        );

        Ok(Buddy {
            raw,
            backing_allocator: Raw,
        })
    }

    /// Decomposes the allocator into its region pointer and size.
    ///
    /// Outstanding allocations stay valid; the region can be handed back to
    /// [`Buddy::from_raw_parts`] to resume allocating from it.
    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.raw.base.ptr(), self.raw.geometry.region_size)
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const MIN_ALLOC: usize> Buddy<MIN_ALLOC, Global> {
    /// Constructs a new `Buddy` over a region of `size` bytes obtained from the
    /// global allocator.
    ///
    /// The region is aligned to its own size, so every block is aligned to its
    /// block size.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (see
    /// [`Buddy::new_raw`]) or if the global allocator fails.
    pub fn try_new(size: usize) -> Result<Self, AllocInitError> {
        let layout = Self::region_layout(size)?;

        let region = unsafe {
            let raw = alloc::alloc::alloc(layout);
            NonNull::new(raw).ok_or(AllocInitError::AllocFailed(layout))?
        };

        match unsafe { RawBuddy::create(region, size, MIN_ALLOC) } {
            Ok(raw) => Ok(Buddy {
                raw,
                backing_allocator: Global,
            }),
            Err(e) => {
                unsafe { alloc::alloc::dealloc(region.as_ptr(), layout) };
                Err(e)
            }
        }
    }
}

impl<const MIN_ALLOC: usize, A: BackingAllocator> Drop for Buddy<MIN_ALLOC, A> {
    fn drop(&mut self) {
        if let Ok(layout) = Self::region_layout(self.raw.geometry.region_size) {
            unsafe {
                self.backing_allocator
                    .deallocate(self.raw.base.ptr(), layout)
            };
        }
    }
}

impl<const MIN_ALLOC: usize, A: BackingAllocator> Buddy<MIN_ALLOC, A> {
    /// Returns the layout of a region of `size` bytes aligned to its own size.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is not a valid region size for this
    /// allocator type.
    pub fn region_layout(size: usize) -> Result<Layout, AllocInitError> {
        check_min_allocation(MIN_ALLOC)?;
        Geometry::new(size, MIN_ALLOC)?;

        Layout::from_size_align(size, size).map_err(|_| AllocInitError::TooLarge { size })
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] spanning the whole block: its
    /// length is the smallest power of two that is at least `size` and at
    /// least `MIN_ALLOC`. The block is aligned to its length relative to the
    /// start of the region.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` is zero, exceeds the region, or no free block is
    /// large enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            return Err(AllocError);
        }

        let level = self.raw.geometry.size_to_level(size).ok_or(AllocError)?;

        let Some(block) = self.raw.allocate_level(level) else {
            log::trace!("allocate({size}): no free block on level {level} or above");
            return Err(AllocError);
        };

        log::trace!("allocate({size}): block {block:#x} on level {level}");

        // The returned block inherits the provenance of the base pointer.
        Ok(self
            .raw
            .base
            .slice_at(block, self.raw.geometry.block_size(level)))
    }

    /// Deallocates the block at `ptr`, which was allocated with a request of
    /// `size` bytes.
    ///
    /// This is cheaper than [`Buddy::free`], which has to recover the block
    /// size from the tree. A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must denote a block currently allocated via this allocator.
    /// - `size` must be the size passed to the [`Buddy::allocate`] call that
    ///   returned the block, or any size that rounds to the same block size.
    pub unsafe fn release(&mut self, ptr: *mut u8, size: usize) {
        let Some(block) = self.block_offset(ptr) else {
            return;
        };

        let Some(level) = self.raw.geometry.size_to_level(size) else {
            debug_assert!(false, "release size {size} exceeds the region");
            return;
        };

        log::trace!("release({block:#x}, {size}): level {level}");

        unsafe { self.raw.coalesce(block, level) };
    }

    /// Deallocates the block at `ptr`.
    ///
    /// The block size is recovered by scanning the tree upward from the
    /// smallest block at `ptr`, which costs one bit test per level. A null
    /// `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated via this allocator.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(block) = self.block_offset(ptr) else {
            return;
        };

        let level = self.raw.level_of(block);

        log::trace!("free({block:#x}): level {level}");

        unsafe { self.raw.coalesce(block, level) };
    }

    /// Returns the size of the block at `ptr`, assuming it is currently
    /// allocated.
    ///
    /// Returns `None` if `ptr` is outside the region or not on a `MIN_ALLOC`
    /// boundary.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let block = self.raw.base.offset_of(ptr.as_ptr())?;
        if block % MIN_ALLOC != 0 {
            return None;
        }

        Some(self.raw.geometry.block_size(self.raw.level_of(block)))
    }

    /// Returns `true` if the byte at `ptr` is inside the region and not part of
    /// any free block.
    ///
    /// Bytes holding the allocator's metadata are reported as allocated. This
    /// walks every free list.
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        let Some(ofs) = self.raw.base.offset_of(ptr) else {
            return false;
        };

        !self.raw.free_blocks().any(|(level, block)| {
            (block..block + self.raw.geometry.block_size(level)).contains(&ofs)
        })
    }

    /// Returns the size of the largest block that can currently be allocated,
    /// or zero if the region is exhausted.
    pub fn largest_available(&self) -> usize {
        self.raw.largest_available()
    }

    /// Returns the total size of all free blocks.
    pub fn available(&self) -> usize {
        self.raw.available()
    }

    /// Returns the number of bytes not in any free block, including the
    /// metadata.
    pub fn used(&self) -> usize {
        self.raw.geometry.region_size - self.available()
    }

    /// Returns the size of the managed region.
    pub fn region_size(&self) -> usize {
        self.raw.geometry.region_size
    }

    /// Returns a pointer to the start of the managed region.
    pub fn region(&self) -> NonNull<u8> {
        self.raw.base.ptr()
    }

    /// Returns the number of bytes at the front of the region that hold the
    /// allocator's metadata, rounded up to whole `MIN_ALLOC` blocks.
    pub fn metadata_size(&self) -> usize {
        self.raw.reserved
    }

    /// Returns `(level, offset)` of every free block, sorted.
    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(usize, usize)> {
        let mut blocks: Vec<_> = self.raw.free_blocks().collect();
        blocks.sort_unstable();
        blocks
    }

    fn block_offset(&self, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }

        let block = self.raw.base.offset_of(ptr);
        debug_assert!(block.is_some(), "pointer outside the managed region");

        let block = block?;
        debug_assert_eq!(block % MIN_ALLOC, 0, "pointer is not a block boundary");
        debug_assert!(block >= self.raw.reserved, "pointer into allocator metadata");

        Some(block)
    }
}

impl<const MIN_ALLOC: usize, A: BackingAllocator> fmt::Debug for Buddy<MIN_ALLOC, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buddy")
            .field("region", &self.raw.base.ptr())
            .field("geometry", &self.raw.geometry)
            .field("metadata_size", &self.raw.reserved)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}
