use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering},
};

use log::{debug, trace};

use crate::{Error, NEEDS_ZEROING, PAGE_SHIFT, PAGE_SIZE, Span, SpanId, SpinMutex};

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Hands physical pages back to the OS. The range reads as zero afterwards.
#[cfg(feature = "release-mem")]
unsafe fn os_release(ptr: *mut u8, size: usize) -> bool {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) == 0 }
}

// =============================================================================
// Buddy allocator (page granular)
// =============================================================================

/// Free blocks per order, plus the dirty bit of every page.
struct Buddy {
  /// `free[order]` holds the first page of each free block of `1 << order` pages.
  free: Box<[Vec<u32>]>,
  /// Page was handed back with the needs-zeroing sentinel.
  dirty: Box<[bool]>,
  pages: usize,
}

impl Buddy {
  fn new(pages: usize) -> Self {
    let max_order = (usize::BITS - 1 - pages.leading_zeros()) as usize;
    let mut buddy = Self {
      free: (0..=max_order).map(|_| Vec::new()).collect(),
      dirty: vec![false; pages].into_boxed_slice(),
      pages,
    };

    // Cover the heap with the largest aligned blocks that fit.
    let mut idx = 0;
    while idx < pages {
      let mut order = max_order;
      while (idx & ((1 << order) - 1)) != 0 || idx + (1 << order) > pages {
        order -= 1;
      }
      buddy.free[order].push(idx as u32);
      idx += 1 << order;
    }
    buddy
  }

  #[inline]
  fn max_order(&self) -> usize {
    self.free.len() - 1
  }

  /// Allocate block of given order, splitting larger blocks if needed.
  fn alloc(&mut self, order: usize) -> Option<usize> {
    let found = (order..=self.max_order()).find(|&o| !self.free[o].is_empty())?;
    let idx = self.free[found].pop()? as usize;
    for split in (order..found).rev() {
      self.free[split].push((idx + (1 << split)) as u32);
    }
    Some(idx)
  }

  /// Free block with buddy coalescing.
  fn free(&mut self, mut idx: usize, mut order: usize) {
    while order < self.max_order() {
      let buddy_idx = idx ^ (1 << order);
      if buddy_idx + (1 << order) > self.pages {
        break;
      }
      let list = &mut self.free[order];
      let Some(pos) = list.iter().position(|&b| b as usize == buddy_idx) else {
        break;
      };
      list.swap_remove(pos);
      idx = idx.min(buddy_idx);
      order += 1;
    }
    self.free[order].push(idx as u32);
  }

  fn mark_dirty(&mut self, idx: usize, order: usize) {
    self.dirty[idx..idx + (1 << order)].fill(true);
  }

  /// Clears the dirty bits of a block, reporting whether any were set.
  fn take_dirty(&mut self, idx: usize, order: usize) -> bool {
    let range = &mut self.dirty[idx..idx + (1 << order)];
    let dirty = range.contains(&true);
    range.fill(false);
    dirty
  }

  fn free_pages(&self) -> usize {
    self
      .free
      .iter()
      .enumerate()
      .map(|(order, list)| list.len() << order)
      .sum()
  }
}

/// Smallest order whose block holds `npages`.
#[inline]
fn order_for(npages: usize) -> usize {
  npages.next_power_of_two().trailing_zeros() as usize
}

// =============================================================================
// Marks
// =============================================================================

/// What the tracing collaborator has been told about a page.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageMark {
  /// Not allocator memory, or handed back.
  Free = 0,
  /// Carved into objects of one size class, no slack at the tail.
  Live = 1,
  /// Carved into objects, with unused bytes after the last object.
  LivePartial = 2,
}

impl PageMark {
  fn from_u8(v: u8) -> Self {
    match v {
      1 => Self::Live,
      2 => Self::LivePartial,
      _ => Self::Free,
    }
  }
}

// =============================================================================
// Page heap
// =============================================================================

/// Page-granular heap over one `mmap` reservation.
///
/// Spans come from a buddy allocator guarded by its own lock. The page map
/// (page to owning span) and the mark table are atomics, readable from any
/// pool without locking.
pub struct PageHeap {
  base: NonNull<u8>,
  pages: usize,
  buddy: SpinMutex<Buddy>,
  /// `0` = no span, otherwise first page of the owning span + 1.
  page_map: Box<[AtomicU32]>,
  marks: Box<[AtomicU8]>,
  pages_in_use: AtomicUsize,
  spans_granted: AtomicUsize,
  spans_released: AtomicUsize,
}

unsafe impl Send for PageHeap {}
unsafe impl Sync for PageHeap {}

impl PageHeap {
  /// Reserves `pages` pages of address space.
  pub fn new(pages: usize) -> Result<Self, Error> {
    if pages == 0 {
      return Err(Error::HeapTooSmall);
    }
    if pages >= u32::MAX as usize {
      return Err(Error::HeapTooLarge { pages });
    }
    let bytes = pages
      .checked_mul(PAGE_SIZE)
      .ok_or(Error::HeapTooLarge { pages })?;

    let raw = unsafe { os_mmap(bytes) };
    let base = NonNull::new(raw).ok_or(Error::ReserveFailed { bytes })?;
    debug!("page heap reserved {pages} pages at {base:p}");

    Ok(Self {
      base,
      pages,
      buddy: SpinMutex::new(Buddy::new(pages)),
      page_map: (0..pages).map(|_| AtomicU32::new(0)).collect(),
      marks: (0..pages).map(|_| AtomicU8::new(PageMark::Free as u8)).collect(),
      pages_in_use: AtomicUsize::new(0),
      spans_granted: AtomicUsize::new(0),
      spans_released: AtomicUsize::new(0),
    })
  }

  #[inline]
  pub fn pages(&self) -> usize {
    self.pages
  }

  #[inline]
  pub fn base(&self) -> usize {
    self.base.as_ptr() as usize
  }

  #[inline]
  fn page_addr(&self, page: usize) -> usize {
    self.base() + (page << PAGE_SHIFT)
  }

  #[inline]
  fn page_of(&self, addr: usize) -> Option<usize> {
    let offset = addr.checked_sub(self.base())?;
    let page = offset >> PAGE_SHIFT;
    (page < self.pages).then_some(page)
  }

  /// Grants a zero-filled span of `npages` pages for size class `class`, or
  /// `None` when the heap is exhausted.
  pub fn allocate_span(&self, npages: usize, class: usize) -> Option<Span> {
    debug_assert!(npages > 0);
    let order = order_for(npages);

    let (idx, dirty) = {
      let mut buddy = self.buddy.lock();
      if order > buddy.max_order() {
        return None;
      }
      let idx = buddy.alloc(order)?;
      (idx, buddy.take_dirty(idx, order))
    };

    let start = self.page_addr(idx);
    if dirty {
      unsafe { ptr::write_bytes(start as *mut u8, 0, PAGE_SIZE << order) };
    }

    let id = SpanId(idx as u32);
    for page in &self.page_map[idx..idx + npages] {
      page.store(id.0 + 1, Ordering::Release);
    }

    self.pages_in_use.fetch_add(1 << order, Ordering::Relaxed);
    self.spans_granted.fetch_add(1, Ordering::Relaxed);
    trace!("granted span {id:?}: {npages} pages for class {class} (zeroed: {dirty})");

    Some(Span::new(id, start, npages, order as u8, class))
  }

  /// Takes back a span no pool owns any more.
  pub fn release_span(&self, span: Span) {
    let idx = span.id().page();
    let order = span.order() as usize;
    debug_assert_eq!(span.start(), self.page_addr(idx));

    for page in &self.page_map[idx..idx + span.npages()] {
      page.store(0, Ordering::Release);
    }

    let start = span.start() as *mut u8;
    #[allow(unused_mut)]
    let mut dirty = unsafe { (start as *const usize).read() } == NEEDS_ZEROING;
    #[cfg(feature = "release-mem")]
    {
      if unsafe { os_release(start, PAGE_SIZE << order) } {
        dirty = false;
      }
    }

    {
      let mut buddy = self.buddy.lock();
      if dirty {
        buddy.mark_dirty(idx, order);
      }
      buddy.free(idx, order);
    }

    self.pages_in_use.fetch_sub(1 << order, Ordering::Relaxed);
    self.spans_released.fetch_add(1, Ordering::Relaxed);
    trace!("released span {:?} ({} pages)", span.id(), span.npages());
  }

  /// Span owning `addr`, if any.
  #[inline]
  pub fn lookup_span(&self, addr: usize) -> Option<SpanId> {
    let page = self.page_of(addr)?;
    match self.page_map[page].load(Ordering::Acquire) {
      0 => None,
      v => Some(SpanId(v - 1)),
    }
  }

  /// Records that `[addr, addr + object_size * count)` holds objects.
  /// `partial` is set when the span has slack after the last object.
  pub fn mark_allocated(&self, addr: usize, object_size: usize, count: usize, partial: bool) {
    let mark = if partial {
      PageMark::LivePartial
    } else {
      PageMark::Live
    };
    self.mark_range(addr, object_size * count, mark);
  }

  /// Records that `[addr, addr + len)` no longer holds objects.
  pub fn mark_free(&self, addr: usize, len: usize) {
    self.mark_range(addr, len, PageMark::Free);
  }

  fn mark_range(&self, addr: usize, len: usize, mark: PageMark) {
    let Some(first) = self.page_of(addr) else {
      return;
    };
    let last = (first + len.div_ceil(PAGE_SIZE)).min(self.pages);
    for page in &self.marks[first..last] {
      page.store(mark as u8, Ordering::Release);
    }
  }

  /// What the tracing collaborator was last told about the page of `addr`.
  pub fn page_mark(&self, addr: usize) -> PageMark {
    self
      .page_of(addr)
      .map_or(PageMark::Free, |page| PageMark::from_u8(self.marks[page].load(Ordering::Acquire)))
  }

  /// Pages currently granted to spans, buddy rounding included.
  #[inline]
  pub fn pages_in_use(&self) -> usize {
    self.pages_in_use.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn spans_granted(&self) -> usize {
    self.spans_granted.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn spans_released(&self) -> usize {
    self.spans_released.load(Ordering::Relaxed)
  }

  /// Pages sitting in the buddy free lists.
  pub fn free_pages(&self) -> usize {
    self.buddy.lock().free_pages()
  }
}

impl Drop for PageHeap {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.pages << PAGE_SHIFT) };
  }
}
