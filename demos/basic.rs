//! Walks through the classic allocation scenario: an oversized request, a
//! handful of small ones, in-place and moving resizes, and the free tree
//! dumped between the steps.

use treealloc::TreeAlloc;

fn main() {
    env_logger::init();

    let mut allocator = TreeAlloc::new();

    unsafe {
        let ptr1 = allocator.alloc(100_000);
        allocator.show("an oversized request gets an arena of its own and stays out of the tree");

        let ptr2 = allocator.alloc(5);
        let ptr3 = allocator.alloc(543);
        let ptr4 = allocator.alloc(4096);
        allocator.show("small requests share a fresh arena, the remainder is the only free block");

        let ptr5 = allocator.alloc(543);
        allocator.show("another request carves the remainder further");

        let ptr1 = allocator.realloc(ptr1, 80_000);
        allocator.show("shrinking the oversized block moves it into a smaller arena");

        allocator.free(ptr5);
        allocator.show("freeing the last request restores the remainder");

        let ptr4 = allocator.realloc(ptr4, 2543);
        allocator.show("an in-place shrink merges the carved tail with the free neighbour");

        allocator.free(ptr1);
        allocator.free(ptr2);
        allocator.free(ptr3);
        allocator.free(ptr4);
        allocator.show("with every block freed the arenas went back to the kernel");
    }
}
