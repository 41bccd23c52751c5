//! Compile-time tunables of the allocator.

use static_assertions::const_assert;

/// Virtual memory page size assumed by the allocator. Arena sizes and the
/// page trimming offsets are all computed against this value, so it has to
/// match the page size of the machine the allocator runs on.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Number of pages in a standard arena. Requests that don't fit a single
/// block of such an arena get an arena of their own, sized exactly.
pub(crate) const ARENA_PAGES: usize = 16;

/// Payload alignment and size granularity. Every pointer handed to the user
/// is aligned to this, and every block size is a multiple of it. The two low
/// bits of `size_curr` carry flags, so this must be at least 4.
pub(crate) const ALIGN: usize = 16;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(ALIGN.is_power_of_two());
const_assert!(ALIGN >= 4);
const_assert!(ARENA_PAGES >= 1);
