//! The user-visible allocator.
//!
//! [`TreeAlloc`] ties the pieces together: it asks the arena manager for
//! memory when the tree has nothing suitable, splits blocks on the way out,
//! coalesces and trims them on the way back in, and resizes in place
//! whenever the neighbour layout allows it.

use std::ptr::{self, NonNull};

use crate::arena::{self, ARENA_SIZE, BLOCK_SIZE_MAX};
use crate::block::{self, Block, BLOCK_HEADER_SIZE, BLOCK_SIZE_MIN};
use crate::config::{ALIGN, PAGE_SIZE};
use crate::kernel;
use crate::tree::Tree;
use crate::utils::{align, round_bytes};

/// Snapshot of the free tree: number of free blocks and their total payload
/// bytes. Oversized blocks never appear here, they live outside the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeStats {
    pub blocks: usize,
    pub bytes: usize,
}

/// A dynamic memory allocator backed by kernel-obtained arenas, with a
/// best-fit tree over the free blocks.
///
/// The allocator is single-threaded: all methods take `&mut self` and run
/// to completion. Pointers returned by [`TreeAlloc::alloc`] stay valid until
/// handed back to [`TreeAlloc::free`] or [`TreeAlloc::realloc`].
pub struct TreeAlloc {
    tree: Tree,
}

impl TreeAlloc {
    /// Creates an allocator with an empty free tree. No kernel memory is
    /// obtained until the first allocation.
    pub const fn new() -> Self {
        Self { tree: Tree::new() }
    }

    /// Allocates `size` bytes and returns a pointer to the payload, aligned
    /// to the allocator's granularity. Returns null when the kernel is out
    /// of memory or when rounding `size` up would overflow.
    ///
    /// **SAFETY**: the returned region must be released through this same
    /// allocator instance.
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe {
            if size > BLOCK_SIZE_MAX {
                // Rounding up to granularity and page size must not wrap.
                if size > usize::MAX - (ALIGN - 1) - PAGE_SIZE - BLOCK_HEADER_SIZE {
                    return ptr::null_mut();
                }
                let arena_size = align(round_bytes(size), PAGE_SIZE) + BLOCK_HEADER_SIZE;
                return match arena::arena_alloc(arena_size) {
                    Some(block) => Block::payload(block).as_ptr(),
                    None => ptr::null_mut(),
                };
            }

            let size = round_bytes(size.max(BLOCK_SIZE_MIN));

            let block = match self.tree.find_best(size) {
                Some(node) => {
                    self.tree.remove(node);
                    Block::from_node(node)
                }
                None => match arena::arena_alloc(size + BLOCK_HEADER_SIZE) {
                    Some(block) => block,
                    None => return ptr::null_mut(),
                },
            };

            if let Some(rest) = block::split(block, size) {
                self.tree_add_block(rest);
            }
            Block::payload(block).as_ptr()
        }
    }

    /// Releases a region previously returned by [`TreeAlloc::alloc`] or
    /// [`TreeAlloc::realloc`]. A null pointer is tolerated.
    ///
    /// The freed block is coalesced with free neighbours, its interior
    /// pages are returned to the kernel, and the whole arena is released
    /// once it holds nothing else.
    ///
    /// **SAFETY**: `ptr` must be null or a live pointer obtained from this
    /// allocator instance; passing anything else is undefined behavior.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        unsafe {
            if ptr.is_null() {
                return;
            }

            let mut block = Block::from_payload(ptr);
            block.as_mut().clear_busy();

            if block.as_ref().size_curr() > BLOCK_SIZE_MAX {
                let bytes = block.as_ref().size_curr() + BLOCK_HEADER_SIZE;
                log::debug!("releasing oversized arena at {:p} ({} bytes)", block.as_ptr(), bytes);
                kernel::release(block.as_ptr().cast(), bytes);
                return;
            }

            if !block.as_ref().is_last() {
                let next = Block::next(block);
                if !next.as_ref().is_busy() {
                    self.tree_remove_block(next);
                    block::merge(block, next);
                }
            }
            if !block.as_ref().is_first() {
                let prev = Block::prev(block);
                if !prev.as_ref().is_busy() {
                    self.tree_remove_block(prev);
                    block::merge(prev, block);
                    block = prev;
                }
            }

            if block.as_ref().is_first() && block.as_ref().is_last() {
                log::debug!("releasing arena at {:p}", block.as_ptr());
                kernel::release(block.as_ptr().cast(), ARENA_SIZE);
            } else {
                block::trim(block);
                self.tree_add_block(block);
            }
        }
    }

    /// Resizes the region at `ptr` to `size` bytes. Shrinking and, when the
    /// right neighbour is free and large enough, growing happen in place;
    /// otherwise the contents move to a fresh allocation and `ptr` is
    /// freed. A null `ptr` behaves like [`TreeAlloc::alloc`].
    ///
    /// Returns the (possibly moved) pointer, or null when allocation fails;
    /// on failure the original region is left untouched.
    ///
    /// **SAFETY**: same contract as [`TreeAlloc::free`] for `ptr`.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe {
            if size > usize::MAX - (ALIGN - 1) {
                return ptr::null_mut();
            }
            let size = round_bytes(size.max(BLOCK_SIZE_MIN));

            if ptr.is_null() {
                return self.alloc(size);
            }

            let block = Block::from_payload(ptr);
            let size_curr = block.as_ref().size_curr();

            if size_curr > BLOCK_SIZE_MAX {
                if size == size_curr {
                    return ptr;
                }
                // Oversized blocks cannot split or grow; any size change
                // moves to a freshly sized arena.
                return self.move_block(ptr, size, size_curr);
            }

            if size == size_curr {
                return ptr;
            }

            if size < size_curr {
                // In-place shrink: the pointer never changes. A last block,
                // or a remainder too small to stand alone, keeps the block
                // at its current size.
                if !block.as_ref().is_last() {
                    if let Some(rest) = block::split(block, size) {
                        let next = Block::next(rest);
                        if !next.as_ref().is_busy() {
                            self.tree_remove_block(next);
                            block::merge(rest, next);
                        }
                        self.tree_add_block(rest);
                    }
                }
                return ptr;
            }

            // Grow in place when the right neighbour is free and the merged
            // block would cover the request.
            if !block.as_ref().is_last() {
                let next = Block::next(block);
                if !next.as_ref().is_busy() {
                    let total = size_curr + next.as_ref().size_curr() + BLOCK_HEADER_SIZE;
                    if total >= size {
                        self.tree_remove_block(next);
                        block::merge(block, next);
                        if let Some(rest) = block::split(block, size) {
                            self.tree_add_block(rest);
                        }
                        return ptr;
                    }
                }
            }

            self.move_block(ptr, size, size_curr)
        }
    }

    /// Copy fallback for [`TreeAlloc::realloc`]: allocate, move the
    /// surviving bytes, release the old region.
    unsafe fn move_block(&mut self, ptr: *mut u8, size: usize, size_curr: usize) -> *mut u8 {
        unsafe {
            let new_ptr = self.alloc(size);
            if !new_ptr.is_null() {
                ptr::copy_nonoverlapping(ptr, new_ptr, size_curr.min(size));
                self.free(ptr);
            }
            new_ptr
        }
    }

    /// Prints `msg` and an in-order dump of the free tree, one block per
    /// line: address, current size, previous size, flags.
    pub fn show(&self, msg: &str) {
        println!("{msg}:");
        if self.tree.is_empty() {
            println!("tree is empty");
        } else {
            self.tree.walk(|node| unsafe {
                let block = Block::from_node(node);
                let header = block.as_ref();
                println!(
                    "[{:p}] {:>10} {:>10} {} {} {}",
                    block.as_ptr(),
                    header.size_curr(),
                    header.size_prev(),
                    if header.is_busy() { "busy" } else { "free" },
                    if header.is_first() { "first" } else { "" },
                    if header.is_last() { "last" } else { "" },
                );
            });
        }
    }

    /// Current free-tree totals.
    pub fn stats(&self) -> FreeStats {
        let mut stats = FreeStats::default();
        self.tree.walk(|node| {
            stats.blocks += 1;
            stats.bytes += unsafe { node.as_ref().key() };
        });
        debug_assert_eq!(stats.blocks, self.tree.len());
        stats
    }

    unsafe fn tree_add_block(&mut self, block: NonNull<Block>) {
        unsafe {
            debug_assert!(!block.as_ref().is_busy());
            self.tree.add(Block::payload(block), block.as_ref().size_curr());
        }
    }

    unsafe fn tree_remove_block(&mut self, block: NonNull<Block>) {
        unsafe {
            debug_assert!(!block.as_ref().is_busy());
            self.tree.remove(Block::node(block));
        }
    }
}

impl Default for TreeAlloc {
    fn default() -> Self {
        Self::new()
    }
}
