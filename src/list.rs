//! Circular free lists threaded through the free blocks themselves.
//!
//! Each list has a sentinel head, a `FreeLink` stored with the allocator's
//! metadata. An empty list is a head linked to itself. Every other element is
//! the first `FreeLink`-sized prefix of a free block.

use crate::base::{BasePtr, FreeLink};

/// A handle to the sentinel head of one free list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeList {
    head: usize,
}

impl FreeList {
    /// Returns a handle to the list whose head is at `head`.
    ///
    /// The head is not touched; use [`FreeList::init`] for a new list.
    #[inline]
    pub fn at(head: usize) -> FreeList {
        FreeList { head }
    }

    /// Initializes an empty list with its head at `head`.
    ///
    /// # Safety
    ///
    /// `head` must be a properly aligned offset, valid for writes for
    /// `size_of::<FreeLink>()` bytes, that is never handed out as a block.
    pub unsafe fn init(base: BasePtr, head: usize) -> FreeList {
        unsafe {
            base.init_link_at(
                head,
                FreeLink {
                    prev: head,
                    next: head,
                },
            )
        };

        FreeList { head }
    }

    /// Returns the offset of the sentinel head.
    #[cfg(test)]
    pub fn head(self) -> usize {
        self.head
    }

    /// Returns `true` if the list holds no blocks.
    ///
    /// # Safety
    ///
    /// The list head must be initialized.
    #[inline]
    pub unsafe fn is_empty(self, base: BasePtr) -> bool {
        unsafe { base.link(self.head).next == self.head }
    }

    /// Appends the free block at `block` to the back of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The list head must be initialized.
    /// - `block` must be a free block, at least `size_of::<FreeLink>()` bytes
    ///   long and properly aligned, that is not already in any list.
    pub unsafe fn push(self, base: BasePtr, block: usize) {
        debug_assert_ne!(block, self.head);

        unsafe {
            let tail = base.link(self.head).prev;

            base.init_link_at(
                block,
                FreeLink {
                    prev: tail,
                    next: self.head,
                },
            );

            base.link_mut(tail).next = block;
            base.link_mut(self.head).prev = block;
        }
    }

    /// Removes and returns the block at the front of the list, or `None` if
    /// the list is empty.
    ///
    /// # Safety
    ///
    /// The list head and every element must be initialized.
    pub unsafe fn pop_front(self, base: BasePtr) -> Option<usize> {
        unsafe {
            let first = base.link(self.head).next;
            if first == self.head {
                return None;
            }

            FreeList::remove(base, first);

            Some(first)
        }
    }

    /// Unlinks `block` from whichever list it is in.
    ///
    /// # Safety
    ///
    /// `block` must be an element (not the head) of an initialized list.
    pub unsafe fn remove(base: BasePtr, block: usize) {
        unsafe {
            let FreeLink { prev, next } = base.link(block);
            debug_assert_ne!(prev, block, "removing a list head");

            // Link `prev` forward to `next` and `next` back to `prev`.
            base.link_mut(prev).next = next;
            base.link_mut(next).prev = prev;
        }
    }

    /// Re-points the neighbours of a head that was copied from `old` to this
    /// list's head, leaving every interior link as it is.
    ///
    /// # Safety
    ///
    /// The link at `self.head()` must be a verbatim copy of an initialized
    /// head at `old`, and the elements it links to must still be free.
    pub unsafe fn adopt(self, base: BasePtr, old: usize) {
        unsafe {
            let FreeLink { prev, next } = base.link(self.head);

            if next == old {
                debug_assert_eq!(prev, old);
                FreeList::init(base, self.head);
                return;
            }

            base.link_mut(next).prev = self.head;
            base.link_mut(prev).next = self.head;
        }
    }

    /// Returns an iterator over the offsets of the blocks in the list.
    ///
    /// # Safety
    ///
    /// The list must not be modified while the iterator is live.
    pub unsafe fn iter(self, base: BasePtr) -> Iter {
        Iter {
            base,
            head: self.head,
            cur: unsafe { base.link(self.head).next },
        }
    }
}

/// An iterator over the blocks in a [`FreeList`].
pub struct Iter {
    base: BasePtr,
    head: usize,
    cur: usize,
}

impl Iterator for Iter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == self.head {
            return None;
        }

        let block = self.cur;
        self.cur = unsafe { self.base.link(block).next };

        Some(block)
    }
}
