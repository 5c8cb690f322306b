use core::{
    mem,
    ptr::{self, NonNull},
};

#[allow(unused_imports)]
use sptr::Strict;

/// A pointer to the base of the region of memory managed by an allocator.
///
/// Everything the allocator keeps inside the region (free links, list heads,
/// the metadata header and the tree bitmap) is addressed by its byte offset
/// from this pointer. Converting an offset back into a pointer happens only
/// here, so every derived pointer carries the provenance of the region.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        ptr.as_ptr()
            .addr()
            .checked_add(extent)
            .expect("region limit overflows usize");

        BasePtr { ptr, extent }
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> usize {
        self.ptr.as_ptr().addr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the offset of `ptr` from the base, or `None` if `ptr` lies
    /// outside the region.
    #[inline]
    pub fn offset_of(self, ptr: *const u8) -> Option<usize> {
        ptr.addr()
            .checked_sub(self.addr())
            .filter(|&ofs| ofs < self.extent)
    }

    /// Creates a pointer to the byte at `offset`.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.extent, "offset out of region");

        // SAFETY: `offset` is within the region, so the result stays within
        // the same allocation and cannot be null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// Creates a slice pointer covering `len` bytes starting at `offset`.
    #[inline]
    pub fn slice_at(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset + len <= self.extent, "slice out of region");

        NonNull::slice_from_raw_parts(self.with_offset(offset), len)
    }

    /// Reads the `FreeLink` at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `offset` must be a properly aligned offset for `FreeLink` values.
    /// - The memory at `offset` must contain a properly initialized
    ///   `FreeLink` value, i.e. it is a list head or a free block.
    #[inline]
    pub unsafe fn link(self, offset: usize) -> FreeLink {
        unsafe { self.link_ptr(offset).read() }
    }

    /// Writes `link` at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `offset` must be a properly aligned offset for `FreeLink` values.
    /// - The memory at `offset` must be valid for writes for
    ///   `size_of::<FreeLink>()` bytes and must not be handed out by the
    ///   allocator.
    #[inline]
    pub unsafe fn init_link_at(self, offset: usize, link: FreeLink) {
        debug_assert!(link.next < self.extent, "next link out of region");
        debug_assert!(link.prev < self.extent, "prev link out of region");

        unsafe { self.link_ptr(offset).write(link) };
    }

    /// Returns a mutable reference to the `FreeLink` at `offset`.
    ///
    /// # Safety
    ///
    /// Same as [`BasePtr::link`]. In addition, no other reference to the same
    /// link may exist while the returned one is live.
    #[inline]
    pub unsafe fn link_mut<'a>(self, offset: usize) -> &'a mut FreeLink {
        unsafe { &mut *self.link_ptr(offset) }
    }

    /// Copies `len` bytes from `src` to `dst`, both offsets into the region.
    ///
    /// # Safety
    ///
    /// The two ranges must not overlap, and neither may contain memory handed
    /// out by the allocator.
    #[inline]
    pub unsafe fn copy_nonoverlapping(self, src: usize, dst: usize, len: usize) {
        debug_assert!(src + len <= self.extent && dst + len <= self.extent);
        debug_assert!(src + len <= dst || dst + len <= src, "overlapping copy");

        unsafe {
            ptr::copy_nonoverlapping(
                self.with_offset(src).as_ptr(),
                self.with_offset(dst).as_ptr(),
                len,
            )
        };
    }

    #[inline]
    fn link_ptr(self, offset: usize) -> *mut FreeLink {
        debug_assert!(offset + mem::size_of::<FreeLink>() <= self.extent);
        debug_assert_eq!(offset % mem::align_of::<FreeLink>(), 0, "misaligned link");

        self.with_offset(offset).cast::<FreeLink>().as_ptr()
    }
}

// Rather than using pointers, store only the offsets of the previous and next
// links.  This avoids accidentally violating stacked borrows; the links "point
// to" other blocks, but by forgoing actual pointers, no borrow is implied. It
// also keeps the links valid when the metadata holding the list heads moves.
//
// NOTE: Using this method, any actual pointer to a block must be acquired via
// the allocator base pointer, and NOT by adding these offsets to some other
// pointer!

/// A double link in a circular list of free blocks.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// doubly linked list.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeLink {
    pub prev: usize,
    pub next: usize,
}
