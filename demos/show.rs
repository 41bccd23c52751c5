//! Minimal tour of the diagnostic surface: `show` dumps the free tree,
//! `stats` sums it up.

use treealloc::TreeAlloc;

fn main() {
    env_logger::init();

    let mut allocator = TreeAlloc::new();

    unsafe {
        let ptrs: Vec<*mut u8> = (0..8).map(|i| unsafe { allocator.alloc(256 << i) }).collect();
        allocator.show("eight live blocks");

        for ptr in ptrs.iter().step_by(2) {
            allocator.free(*ptr);
        }
        allocator.show("every other block freed");
        println!("{:?}", allocator.stats());

        for ptr in ptrs.iter().skip(1).step_by(2) {
            allocator.free(*ptr);
        }
        allocator.show("all blocks freed");
    }
}
