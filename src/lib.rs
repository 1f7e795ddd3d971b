//! `centralis`: the central free-list tier of a slab allocator.
//!
//! Objects of one size class are carved out of page spans and handed to
//! per-thread caches in batches:
//!
//! - [`PageHeap`]: page-granular buddy heap over one `mmap` reservation. Grants
//!   and reclaims spans, answers address to span lookups.
//! - [`CentralPool`]: one per size class. Keeps spans with free objects on the
//!   `nonempty` list and fully allocated ones on the `empty` list, moves
//!   objects in and out in batches under a single spin lock.
//! - [`CentralPools`]: the fixed array of pools, indexed by size class.
//! - [`LocalCache`]: a single-owner cache that refills and drains through the
//!   batch API.
//!
//! Freeing an address that does not belong to a live span of the pool is an
//! unrecoverable invariant violation and panics with `"invalid free"`. Release
//! builds abort on panic.

#![allow(clippy::missing_safety_doc)]

mod batch;
mod cache;
mod central;
mod error;
mod link;
mod page_heap;
mod size_class;
mod span;
mod sync;

pub use batch::{Batch, BatchIter};
pub use cache::LocalCache;
pub use central::{CentralPool, CentralPools, PoolStats};
pub use error::Error;
pub use page_heap::{PageHeap, PageMark};
pub use size_class::{SizeClassInfo, SizeClassTable};
pub use span::{Span, SpanId};
pub use sync::{SpinGuard, SpinMutex};

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
/// Heap page size (8KB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest span the default geometry asks for, in pages.
pub const MAX_SPAN_PAGES: usize = 32;

/// Written to the first word of a span handed back to the page heap: its pages
/// are dirty and must be cleared before the next grant.
pub(crate) const NEEDS_ZEROING: usize = 1;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_SPAN_PAGES.is_power_of_two());

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
