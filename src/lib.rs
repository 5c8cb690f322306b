//! A binary-buddy allocator that keeps its own bookkeeping inside the single
//! power-of-two region it manages.
//!
//! Every request is rounded up to a power-of-two block aligned to its own size
//! within the region. Free blocks are threaded onto per-level circular lists
//! through their own first bytes, and the state of every block in the implicit
//! tree is packed into two bit planes of one bitmap. The list heads, the bitmap
//! and a small header are placed at the front of the region by a bootstrap
//! step that allocates them from the region itself, so nothing outside the
//! region is needed.
//!
//! ```
//! use buddy_region::{Buddy, Raw, DEFAULT_MIN_ALLOCATION};
//! use core::ptr::NonNull;
//!
//! #[repr(C, align(4096))]
//! struct Region([u8; 16384]);
//!
//! let mut region = Region([0; 16384]);
//! let ptr = NonNull::new(region.0.as_mut_ptr()).unwrap();
//!
//! let mut buddy =
//!     unsafe { Buddy::<DEFAULT_MIN_ALLOCATION, Raw>::new_raw(ptr, 16384) }.unwrap();
//! let before = buddy.available();
//!
//! let block = buddy.allocate(100).unwrap();
//! assert_eq!(block.len(), 128);
//!
//! unsafe { buddy.free(block.cast::<u8>().as_ptr()) };
//! assert_eq!(buddy.available(), before);
//! ```
//!
//! The allocator is single-threaded; share it between threads behind a lock.

#![doc(html_root_url = "https://docs.rs/buddy_region/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
// This is necessary to allow `sptr` to shadow methods that newer compilers
// provide inherently.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
pub mod buddy;
mod geometry;
mod list;

#[cfg(test)]
mod tests;

use core::{alloc::Layout, mem, ptr::NonNull};

pub use crate::buddy::Buddy;

/// The default minimum block size: room for one free-list link.
pub const DEFAULT_MIN_ALLOCATION: usize = mem::size_of::<base::FreeLink>();

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// the managed region, but the underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    #[error("allocation of {} bytes failed", .0.size())]
    AllocFailed(Layout),

    /// The region size is not a power of two.
    #[error("region size {size} is not a power of two")]
    NotPowerOfTwo {
        /// The requested region size.
        size: usize,
    },

    /// The region size does not fit a [`Layout`].
    #[error("region size {size} exceeds isize::MAX")]
    TooLarge {
        /// The requested region size.
        size: usize,
    },

    /// The region is smaller than one minimum-size block.
    #[error("region size {size} is smaller than the minimum block size {min}")]
    TooSmall {
        /// The requested region size.
        size: usize,
        /// The minimum block size.
        min: usize,
    },

    /// The region cannot host its own metadata.
    ///
    /// The metadata, rounded up to whole minimum-size blocks, must be smaller
    /// than half the region.
    #[error("region of {size} bytes cannot host {metadata} bytes of metadata")]
    MetadataTooLarge {
        /// The requested region size.
        size: usize,
        /// The bytes of metadata the region would need to reserve.
        metadata: usize,
    },

    /// The minimum block size is not a power of two or cannot hold a free
    /// list link.
    #[error("invalid minimum block size {min}")]
    InvalidMinAllocation {
        /// The configured minimum block size.
        min: usize,
    },

    /// The region pointer is not aligned to the minimum block size.
    #[error("region must be aligned to {align} bytes")]
    Misaligned {
        /// The required alignment.
        align: usize,
    },

    /// The region does not start with metadata written by this crate, or the
    /// metadata disagrees with the allocator type.
    #[error("region does not hold a valid allocator header")]
    InvalidHeader,
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// request size.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("memory allocation failed")]
pub struct AllocError;

/// Types which provide memory which backs an allocator.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that an allocator is not backed by another
///   allocator. This is the case when constructing the allocator from raw
///   pointers. Memory used by this allocator can be reclaimed using
///   `.into_raw_parts()`.
/// - The `Global` marker type indicates that an allocator is backed by the
///   global allocator. The allocator will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that an allocator is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
