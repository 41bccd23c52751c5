//! Arena acquisition.
//!
//! An arena is a contiguous region obtained from the kernel shim. Arenas
//! come in one standard size for normal requests; a request too large for a
//! single block of a standard arena gets an arena of its own, sized exactly
//! to fit that one block. There is no arena registry: arenas are reachable
//! only through the free tree and through the pointers handed to the user,
//! and they are released by the façade when their last block turns free.

use std::ptr::NonNull;

use crate::block::{Block, BLOCK_HEADER_SIZE};
use crate::config::{ARENA_PAGES, PAGE_SIZE};
use crate::kernel;

/// Bytes in a standard arena.
pub(crate) const ARENA_SIZE: usize = ARENA_PAGES * PAGE_SIZE;

/// Largest payload a block of a standard arena can carry. Anything bigger
/// lives in an arena of its own and stays out of the free tree.
pub(crate) const BLOCK_SIZE_MAX: usize = ARENA_SIZE - BLOCK_HEADER_SIZE;

/// Obtains an arena holding a single free seed block.
///
/// `size` counts the seed block's header. Oversized requests get exactly
/// `size` bytes; everything else gets a standard arena. The seed block is
/// not inserted into the tree here, the caller decides what to do with it.
pub(crate) unsafe fn arena_alloc(size: usize) -> Option<NonNull<Block>> {
    unsafe {
        let bytes = if size > ARENA_SIZE { size } else { ARENA_SIZE };

        let addr = kernel::obtain(bytes)?;
        let block = addr.cast::<Block>();
        Block::arena_init(block, bytes - BLOCK_HEADER_SIZE);

        log::debug!("new arena at {:p} ({} bytes)", addr.as_ptr(), bytes);
        Some(block)
    }
}
