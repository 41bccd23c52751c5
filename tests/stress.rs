//! Randomised workload over the public surface: allocate, resize and free
//! in arbitrary interleavings, with sentinel bytes verifying that no block
//! ever treads on another and that resize preserves contents.

use rand::{Rng, RngCore, SeedableRng};
use treealloc::{FreeStats, TreeAlloc};

const SLOTS: usize = 64;
const ROUNDS: usize = 20_000;

struct Slot {
    ptr: *mut u8,
    size: usize,
    tag: u8,
}

unsafe fn fill(slot: &Slot) {
    unsafe { std::ptr::write_bytes(slot.ptr, slot.tag, slot.size) };
}

unsafe fn verify(slot: &Slot, len: usize) {
    unsafe {
        for offset in [0, len / 2, len - 1] {
            assert_eq!(
                *slot.ptr.add(offset),
                slot.tag,
                "payload corrupted at offset {offset} of {len}"
            );
        }
    }
}

#[test]
fn random_workload_stays_consistent() {
    let _ = env_logger::builder().is_test(true).try_init();

    let seed = rand::thread_rng().next_u64();
    log::info!("using seed {seed}");
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut allocator = TreeAlloc::new();
    let mut slots: Vec<Option<Slot>> = (0..SLOTS).map(|_| None).collect();

    for round in 0..ROUNDS {
        let index = rng.gen_range(0..SLOTS);
        match slots[index].take() {
            None => {
                // Mostly small blocks, with the occasional oversized one.
                let size = if rng.gen_ratio(1, 100) {
                    rng.gen_range(70_000..250_000)
                } else {
                    rng.gen_range(1..=8192)
                };
                let ptr = unsafe { allocator.alloc(size) };
                assert!(!ptr.is_null());
                assert_eq!(ptr as usize % 16, 0, "misaligned pointer");

                let slot = Slot {
                    ptr,
                    size,
                    tag: (round as u8) | 1,
                };
                unsafe { fill(&slot) };
                slots[index] = Some(slot);
            }
            Some(mut slot) => {
                unsafe { verify(&slot, slot.size) };

                if rng.gen_ratio(1, 4) {
                    let new_size = if rng.gen_ratio(1, 100) {
                        rng.gen_range(70_000..250_000)
                    } else {
                        rng.gen_range(1..=16_384)
                    };
                    let new_ptr = unsafe { allocator.realloc(slot.ptr, new_size) };
                    assert!(!new_ptr.is_null());
                    assert_eq!(new_ptr as usize % 16, 0, "misaligned pointer");

                    // Whatever survives the resize must be intact.
                    slot.ptr = new_ptr;
                    unsafe { verify(&slot, slot.size.min(new_size)) };

                    slot.size = new_size;
                    unsafe { fill(&slot) };
                    slots[index] = Some(slot);
                } else {
                    unsafe { allocator.free(slot.ptr) };
                }
            }
        }
    }

    for slot in &mut slots {
        if let Some(slot) = slot.take() {
            unsafe {
                verify(&slot, slot.size);
                allocator.free(slot.ptr);
            }
        }
    }

    // Every arena went back to the kernel, so nothing is left to index.
    assert_eq!(allocator.stats(), FreeStats::default());
}

#[test]
fn fifo_and_lifo_churn() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut allocator = TreeAlloc::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x7e7e);

    for _ in 0..50 {
        let ptrs: Vec<(*mut u8, usize)> = (0..32)
            .map(|_| {
                let size = rng.gen_range(1..=4096);
                (unsafe { allocator.alloc(size) }, size)
            })
            .collect();
        for &(ptr, size) in &ptrs {
            assert!(!ptr.is_null());
            unsafe { std::ptr::write_bytes(ptr, 0x5a, size) };
        }

        // Drain front-to-back one round, back-to-front the next.
        if rng.gen_bool(0.5) {
            for &(ptr, _) in &ptrs {
                unsafe { allocator.free(ptr) };
            }
        } else {
            for &(ptr, _) in ptrs.iter().rev() {
                unsafe { allocator.free(ptr) };
            }
        }
        assert_eq!(allocator.stats(), FreeStats::default());
    }
}
