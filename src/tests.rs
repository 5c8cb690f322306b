#![cfg(test)]
extern crate std;

use core::{alloc::Layout, marker::PhantomData, ptr, ptr::NonNull, slice};

use crate::{AllocError, AllocInitError, Buddy, Global, Raw, DEFAULT_MIN_ALLOCATION};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};
#[allow(unused_imports)]
use sptr::Strict;

type GlobalBuddy<const MIN: usize> = Buddy<MIN, Global>;

fn offset_in<const MIN: usize>(buddy: &GlobalBuddy<MIN>, ptr: *const u8) -> usize {
    ptr.addr() - buddy.region().as_ptr().addr()
}

fn rounded<const MIN: usize>(len: usize) -> usize {
    len.next_power_of_two().max(MIN)
}

// Parameters =================================================================

#[derive(Clone, Debug)]
struct BuddyParams<const MIN: usize> {
    size: usize,
}

impl<const MIN: usize> Arbitrary for BuddyParams<MIN> {
    fn arbitrary(g: &mut Gen) -> Self {
        // 1 KiB to 64 KiB.
        BuddyParams {
            size: 1 << (10 + u32::arbitrary(g) % 7),
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let smaller = (self.size > 1024).then(|| BuddyParams {
            size: self.size / 2,
        });

        Box::new(smaller.into_iter())
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
    Release,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a block of at least `len` bytes.
    Allocate { len: usize },
    /// Free an existing allocation by address alone.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
    /// Free an existing allocation, passing the size it was requested with.
    Release { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 14;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Free,
                AllocatorOpTag::Release,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_size(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
            AllocatorOpTag::Release => AllocatorOp::Release {
                index: usize::arbitrary(g),
            },
        }
    }
}

// Checker ====================================================================

type OpId = u32;

type AllocResult = Result<NonNull<[u8]>, AllocError>;

struct Allocation {
    id: OpId,
    ptr: NonNull<[u8]>,
    /// The size passed to `allocate`.
    len: usize,
}

trait Prop {
    /// Examines the result of an allocation.
    fn post_allocate<const MIN: usize>(
        buddy: &GlobalBuddy<MIN>,
        op_id: OpId,
        len: usize,
        res: &AllocResult,
    ) -> bool {
        let _ = (buddy, op_id, len, res);
        true
    }

    fn pre_deallocate(allocation: &Allocation) -> bool {
        let _ = allocation;
        true
    }

    /// Examines the allocator after every operation.
    fn post_op<const MIN: usize>(buddy: &GlobalBuddy<MIN>) -> bool {
        let _ = buddy;
        true
    }
}

struct AllocatorChecker<const MIN: usize, P: Prop> {
    buddy: GlobalBuddy<MIN>,
    allocations: Vec<Allocation>,
    num_ops: u32,
    phantom: PhantomData<P>,
}

impl<const MIN: usize, P: Prop> AllocatorChecker<MIN, P> {
    fn new(params: BuddyParams<MIN>, capacity: usize) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            buddy: Buddy::try_new(params.size)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
            phantom: PhantomData,
        })
    }

    fn deallocate(&mut self, a: Allocation, by_size: bool) -> bool {
        if !P::pre_deallocate(&a) {
            return false;
        }

        let ptr = a.ptr.cast::<u8>().as_ptr();
        unsafe {
            if by_size {
                self.buddy.release(ptr, a.len);
            } else {
                self.buddy.free(ptr);
            }
        }

        true
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        let ok = match op {
            AllocatorOp::Allocate { len } => {
                let res = self.buddy.allocate(len);

                if !P::post_allocate(&self.buddy, op_id, len, &res) {
                    return false;
                }

                if let Ok(ptr) = res {
                    self.allocations.push(Allocation {
                        id: op_id,
                        ptr,
                        len,
                    });
                }

                true
            }

            AllocatorOp::Free { index } | AllocatorOp::Release { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                self.deallocate(a, matches!(op, AllocatorOp::Release { .. }))
            }
        };

        ok && P::post_op(&self.buddy)
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations, alternating the two entry points.
        let allocations: Vec<_> = self.allocations.drain(..).collect();
        for (i, a) in allocations.into_iter().enumerate() {
            if !self.deallocate(a, i % 2 == 0) {
                return false;
            }
        }

        P::post_op(&self.buddy)
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 10;

// Properties =================================================================

/// Live blocks never overlap each other or the allocator's own metadata.
struct MutuallyExclusive;

impl Prop for MutuallyExclusive {
    fn post_allocate<const MIN: usize>(
        _: &GlobalBuddy<MIN>,
        op_id: OpId,
        _: usize,
        res: &AllocResult,
    ) -> bool {
        if let Ok(block) = res {
            let words = unsafe {
                slice::from_raw_parts_mut(block.cast::<u32>().as_ptr(), block.len() / 4)
            };
            words.fill(op_id);
        }

        true
    }

    fn pre_deallocate(allocation: &Allocation) -> bool {
        let words = unsafe {
            slice::from_raw_parts(
                allocation.ptr.cast::<u32>().as_ptr(),
                allocation.ptr.len() / 4,
            )
        };

        words.iter().all(|&word| word == allocation.id)
    }
}

/// Block sizes, alignment, failures and byte counts are consistent.
struct Accounting;

impl Prop for Accounting {
    fn post_allocate<const MIN: usize>(
        buddy: &GlobalBuddy<MIN>,
        _: OpId,
        len: usize,
        res: &AllocResult,
    ) -> bool {
        match res {
            Ok(block) => {
                let ofs = offset_in(buddy, block.cast::<u8>().as_ptr());
                block.len() == rounded::<MIN>(len)
                    && ofs % block.len() == 0
                    && ofs >= buddy.metadata_size()
                    && ofs + block.len() <= buddy.region_size()
            }

            // Failure is only allowed if no free block is large enough.
            Err(AllocError) => {
                len == 0
                    || len > buddy.region_size()
                    || buddy.largest_available() < rounded::<MIN>(len)
            }
        }
    }

    fn post_op<const MIN: usize>(buddy: &GlobalBuddy<MIN>) -> bool {
        buddy.used() + buddy.available() == buddy.region_size()
            && buddy.used() >= buddy.metadata_size()
            && buddy.largest_available() <= buddy.available()
    }
}

fn check<const MIN: usize, P: Prop>(params: BuddyParams<MIN>, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<MIN, P> =
        AllocatorChecker::new(params, ops.len()).unwrap();
    checker.run(ops)
}

/// Freeing everything restores exactly the free lists present after
/// construction.
fn check_restores<const MIN: usize>(params: BuddyParams<MIN>, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<MIN, Accounting> =
        AllocatorChecker::new(params, ops.len()).unwrap();
    let initial = checker.buddy.free_blocks();
    let largest = checker.buddy.largest_available();

    checker.run(ops)
        && checker.buddy.free_blocks() == initial
        && checker.buddy.largest_available() == largest
        && checker.buddy.used() == checker.buddy.metadata_size()
}

/// Freeing by address leaves the tree in the same state as freeing by size.
fn check_free_matches_release<const MIN: usize>(
    params: BuddyParams<MIN>,
    ops: Vec<AllocatorOp>,
) -> bool {
    let mut by_addr = GlobalBuddy::<MIN>::try_new(params.size).unwrap();
    let mut by_size = GlobalBuddy::<MIN>::try_new(params.size).unwrap();
    let mut live = Vec::new();

    for op in ops {
        match op {
            AllocatorOp::Allocate { len } => match (by_addr.allocate(len), by_size.allocate(len)) {
                (Ok(a), Ok(b)) => {
                    let a = a.cast::<u8>().as_ptr();
                    let b = b.cast::<u8>().as_ptr();
                    if offset_in(&by_addr, a) != offset_in(&by_size, b) {
                        return false;
                    }
                    live.push((a, b, len));
                }
                (Err(_), Err(_)) => (),
                _ => return false,
            },

            AllocatorOp::Free { index } | AllocatorOp::Release { index } => {
                if live.is_empty() {
                    continue;
                }

                let (a, b, len) = live.swap_remove(index % live.len());
                unsafe {
                    by_addr.free(a);
                    by_size.release(b, len);
                }
            }
        }

        if by_addr.free_blocks() != by_size.free_blocks() {
            return false;
        }
    }

    true
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<16, MutuallyExclusive> as fn(_, _) -> bool);
    qc.quickcheck(check::<64, MutuallyExclusive> as fn(_, _) -> bool);
    qc.quickcheck(check::<256, MutuallyExclusive> as fn(_, _) -> bool);
}

#[test]
fn buddy_accounting_is_consistent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<16, Accounting> as fn(_, _) -> bool);
    qc.quickcheck(check::<128, Accounting> as fn(_, _) -> bool);
}

#[test]
fn freeing_everything_restores_initial_state() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_restores::<16> as fn(_, _) -> bool);
    qc.quickcheck(check_restores::<32> as fn(_, _) -> bool);
}

#[test]
fn free_by_address_matches_release_by_size() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check_free_matches_release::<16> as fn(_, _) -> bool);
    qc.quickcheck(check_free_matches_release::<64> as fn(_, _) -> bool);
}

#[test]
fn single_round_trip_restores_counters() {
    fn prop(params: BuddyParams<16>, len: usize) -> bool {
        let mut buddy = GlobalBuddy::<16>::try_new(params.size).unwrap();
        let available = buddy.available();
        let largest = buddy.largest_available();

        let len = len % params.size + 1;
        match buddy.allocate(len) {
            Ok(block) => unsafe { buddy.free(block.cast::<u8>().as_ptr()) },
            Err(AllocError) => return largest < rounded::<16>(len),
        }

        buddy.available() == available && buddy.largest_available() == largest
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_, _) -> bool);
}

// Scenarios ==================================================================

#[test]
fn bootstrap_reserves_metadata() {
    let buddy = GlobalBuddy::<16>::try_new(16384).unwrap();
    let meta = buddy.metadata_size();

    assert!(meta > 0 && meta < 8192);
    assert_eq!(meta % 16, 0);
    assert_eq!(buddy.used(), meta);
    assert_eq!(buddy.available(), 16384 - meta);
    assert_eq!(buddy.largest_available(), 8192);

    let base = buddy.region().as_ptr();
    for ofs in 0..meta {
        assert!(buddy.is_allocated(base.wrapping_add(ofs)), "byte {ofs}");
    }
    assert!(!buddy.is_allocated(base.wrapping_add(meta)));
    assert!(!buddy.is_allocated(base.wrapping_add(16383)));
    assert!(!buddy.is_allocated(base.wrapping_add(16384)));
}

#[test]
fn whole_region_is_never_available() {
    let mut buddy = GlobalBuddy::<16>::try_new(16384).unwrap();

    assert_eq!(buddy.allocate(16384), Err(AllocError));

    let half = buddy.allocate(8192).unwrap();
    assert_eq!(half.len(), 8192);
    assert_eq!(offset_in(&buddy, half.cast::<u8>().as_ptr()), 8192);
    assert_eq!(buddy.usable_size(half.cast()), Some(8192));

    unsafe { buddy.free(half.cast::<u8>().as_ptr()) };
    assert_eq!(buddy.largest_available(), 8192);
}

#[test]
fn sizes_round_up_to_blocks() {
    let mut buddy = GlobalBuddy::<16>::try_new(1 << 16).unwrap();

    for (len, expected) in [(1, 16), (16, 16), (17, 32), (100, 128), (4000, 4096)] {
        let block = buddy.allocate(len).unwrap();
        assert_eq!(block.len(), expected);
        assert_eq!(offset_in(&buddy, block.cast::<u8>().as_ptr()) % expected, 0);
        assert_eq!(buddy.usable_size(block.cast()), Some(expected));
    }
}

#[test]
fn rejected_requests() {
    let mut buddy = GlobalBuddy::<16>::try_new(4096).unwrap();
    let available = buddy.available();

    assert_eq!(buddy.allocate(0), Err(AllocError));
    assert_eq!(buddy.allocate(4097), Err(AllocError));
    assert_eq!(buddy.allocate(usize::MAX), Err(AllocError));

    unsafe {
        buddy.free(ptr::null_mut());
        buddy.release(ptr::null_mut(), 16);
    }

    assert_eq!(buddy.available(), available);
}

#[test]
fn mib_region_reuses_freed_blocks() {
    let mut buddy = GlobalBuddy::<16>::try_new(1 << 20).unwrap();
    let base_used = buddy.used();

    let assert_counts = |buddy: &GlobalBuddy<16>, live: usize| {
        assert_eq!(buddy.used(), base_used + live * 16);
        assert_eq!(buddy.used() + buddy.available(), 1 << 20);
    };

    let alloc16 = |buddy: &mut GlobalBuddy<16>| buddy.allocate(16).unwrap().cast::<u8>().as_ptr();

    let mut blocks: Vec<*mut u8> = (0..12).map(|_| alloc16(&mut buddy)).collect();
    assert_counts(&buddy, 12);

    for block in blocks.drain(..5) {
        unsafe { buddy.free(block) };
    }
    assert_counts(&buddy, 7);

    for _ in 0..5 {
        blocks.push(alloc16(&mut buddy));
    }
    assert_counts(&buddy, 12);

    // Free three from the middle.
    for block in blocks.drain(4..7) {
        unsafe { buddy.free(block) };
    }
    assert_counts(&buddy, 9);

    for _ in 0..6 {
        blocks.push(alloc16(&mut buddy));
    }
    assert_counts(&buddy, 15);

    let mut sorted = blocks.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 15);

    for block in blocks {
        assert!(buddy.is_allocated(block));
        unsafe { buddy.free(block) };
    }
    assert_counts(&buddy, 0);
}

#[test]
fn exhaustion_and_recovery() {
    let mut buddy = GlobalBuddy::<16>::try_new(4096).unwrap();
    let initial = buddy.free_blocks();
    let expected = (4096 - buddy.metadata_size()) / 16;

    let mut blocks = Vec::new();
    while let Ok(block) = buddy.allocate(16) {
        blocks.push(block.cast::<u8>().as_ptr());
    }

    assert_eq!(blocks.len(), expected);
    assert_eq!(buddy.available(), 0);
    assert_eq!(buddy.largest_available(), 0);
    assert_eq!(buddy.allocate(1), Err(AllocError));

    for block in blocks.into_iter().rev() {
        unsafe { buddy.free(block) };
    }

    assert_eq!(buddy.free_blocks(), initial);
}

#[test]
fn free_recovers_every_level() {
    let mut by_addr = GlobalBuddy::<16>::try_new(1 << 14).unwrap();
    let mut by_size = GlobalBuddy::<16>::try_new(1 << 14).unwrap();
    let initial = by_addr.free_blocks();

    let mut size = 16;
    while size <= 1 << 13 {
        let a = by_addr.allocate(size).unwrap().cast::<u8>().as_ptr();
        let b = by_size.allocate(size).unwrap().cast::<u8>().as_ptr();
        assert_eq!(by_addr.usable_size(NonNull::new(a).unwrap()), Some(size));

        unsafe {
            by_addr.free(a);
            by_size.release(b, size);
        }

        assert_eq!(by_addr.free_blocks(), initial);
        assert_eq!(by_size.free_blocks(), initial);
        size *= 2;
    }
}

#[test]
fn buddies_coalesce() {
    let mut buddy = GlobalBuddy::<16>::try_new(1 << 12).unwrap();
    let initial = buddy.free_blocks();

    // Use up the block left over beside the metadata, so the next two are
    // split from one parent.
    let filler = buddy.allocate(1024).unwrap().cast::<u8>().as_ptr();
    assert_eq!(offset_in(&buddy, filler), 1024);

    let a = buddy.allocate(1024).unwrap().cast::<u8>().as_ptr();
    let b = buddy.allocate(1024).unwrap().cast::<u8>().as_ptr();
    assert_eq!(offset_in(&buddy, a), 2048);
    assert_eq!(offset_in(&buddy, b), 3072);
    assert_eq!(buddy.largest_available(), 512);

    unsafe { buddy.free(a) };
    assert_eq!(buddy.largest_available(), 1024);

    unsafe { buddy.free(b) };
    assert_eq!(buddy.largest_available(), 2048);

    unsafe { buddy.free(filler) };
    assert_eq!(buddy.free_blocks(), initial);
}

// Construction ===============================================================

#[test]
fn invalid_configurations() {
    assert_eq!(
        GlobalBuddy::<16>::try_new(3000).unwrap_err(),
        AllocInitError::NotPowerOfTwo { size: 3000 }
    );
    assert_eq!(
        GlobalBuddy::<16>::try_new(8).unwrap_err(),
        AllocInitError::TooSmall { size: 8, min: 16 }
    );
    assert!(matches!(
        GlobalBuddy::<16>::try_new(256),
        Err(AllocInitError::MetadataTooLarge { size: 256, .. })
    ));
    assert_eq!(
        GlobalBuddy::<24>::try_new(4096).unwrap_err(),
        AllocInitError::InvalidMinAllocation { min: 24 }
    );
    assert_eq!(
        GlobalBuddy::<4>::try_new(4096).unwrap_err(),
        AllocInitError::InvalidMinAllocation { min: 4 }
    );

    // The smallest region that can host its own metadata.
    assert!(GlobalBuddy::<16>::try_new(512).is_ok());
}

#[test]
fn default_min_allocation_holds_a_link() {
    let buddy = GlobalBuddy::<DEFAULT_MIN_ALLOCATION>::try_new(4096).unwrap();
    assert_eq!(DEFAULT_MIN_ALLOCATION, 2 * core::mem::size_of::<usize>());
    assert_eq!(buddy.metadata_size() % DEFAULT_MIN_ALLOCATION, 0);
}

struct RawRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawRegion {
    fn new(size: usize) -> RawRegion {
        let layout = Layout::from_size_align(size, size).unwrap();
        let ptr = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) }).unwrap();

        RawRegion { ptr, layout }
    }
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[test]
fn raw_parts_round_trip() {
    let region = RawRegion::new(8192);

    let mut buddy = unsafe { Buddy::<16, Raw>::new_raw(region.ptr, 8192) }.unwrap();
    let block = buddy.allocate(100).unwrap();
    unsafe { block.cast::<u8>().as_ptr().write_bytes(0xAB, block.len()) };

    let available = buddy.available();
    let (ptr, size) = buddy.into_raw_parts();
    assert_eq!((ptr, size), (region.ptr, 8192));

    let mut buddy = unsafe { Buddy::<16, Raw>::from_raw_parts(ptr) }.unwrap();
    assert_eq!(buddy.available(), available);
    assert_eq!(buddy.usable_size(block.cast()), Some(128));

    let contents = unsafe { block.as_ref() };
    assert!(contents.iter().all(|&b| b == 0xAB));

    unsafe { buddy.free(block.cast::<u8>().as_ptr()) };
    assert_eq!(buddy.used(), buddy.metadata_size());

    let (ptr, _) = buddy.into_raw_parts();
    assert_eq!(
        unsafe { Buddy::<32, Raw>::from_raw_parts(ptr) }.unwrap_err(),
        AllocInitError::InvalidHeader
    );
}

#[test]
fn raw_region_checks() {
    let region = RawRegion::new(4096);

    assert_eq!(
        unsafe { Buddy::<16, Raw>::from_raw_parts(region.ptr) }.unwrap_err(),
        AllocInitError::InvalidHeader
    );

    let misaligned = NonNull::new(region.ptr.as_ptr().wrapping_add(8)).unwrap();
    assert_eq!(
        unsafe { Buddy::<16, Raw>::new_raw(misaligned, 2048) }.unwrap_err(),
        AllocInitError::Misaligned { align: 16 }
    );
}

#[test]
fn buddy_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<GlobalBuddy<16>>();
    assert_send::<Buddy<16, Raw>>();
}

#[test]
fn debug_output() {
    let buddy = GlobalBuddy::<16>::try_new(4096).unwrap();
    let s = std::format!("{buddy:?}");
    assert!(s.starts_with("Buddy"));
    assert!(s.contains("metadata_size"));
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
