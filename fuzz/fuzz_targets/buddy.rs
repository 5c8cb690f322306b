#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use buddy_region::{Buddy, Global};
use libfuzzer_sys::fuzz_target;

const MIN_ALLOC: usize = 32;

/// Largest region exercised, expressed in bits.
const MAX_REGION_BITS: u8 = 20;

#[derive(Clone, Debug)]
struct RegionSize(usize);

impl Arbitrary<'_> for RegionSize {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<RegionSize> {
        // Any power of two, including ones too small to host the metadata.
        let shift = u8::arbitrary(un)? % (MAX_REGION_BITS + 1);
        Ok(RegionSize(1 << shift))
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(usize),
    Free(usize),
    Release(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    size: RegionSize,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let mut buddy = match Buddy::<MIN_ALLOC, Global>::try_new(args.size.0) {
        Ok(b) => b,
        Err(_) => return,
    };

    let initial = buddy.available();

    // (block, requested size, fill byte)
    let mut outstanding = Vec::new();

    for (i, op) in args.ops.into_iter().enumerate() {
        match op {
            BuddyOp::Allocate(size) => {
                if let Ok(block) = buddy.allocate(size) {
                    assert!(block.len() >= size);

                    let fill = i as u8;
                    unsafe { block.cast::<u8>().as_ptr().write_bytes(fill, block.len()) };
                    outstanding.push((block, size, fill));
                }
            }

            BuddyOp::Free(raw_idx) | BuddyOp::Release(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let (block, size, fill) = outstanding.swap_remove(idx);

                let contents = unsafe { block.as_ref() };
                assert!(contents.iter().all(|&b| b == fill), "block was clobbered");

                let ptr = block.cast::<u8>().as_ptr();
                match op {
                    BuddyOp::Release(_) => unsafe { buddy.release(ptr, size) },
                    _ => unsafe { buddy.free(ptr) },
                }
            }
        }

        assert_eq!(buddy.used() + buddy.available(), buddy.region_size());
    }

    for (block, _, _) in outstanding {
        unsafe { buddy.free(block.cast::<u8>().as_ptr()) };
    }

    assert_eq!(buddy.available(), initial);
});
