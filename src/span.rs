//! Span metadata and the span lists a central pool keeps them on.
//!
//! Spans live in a [`SpanTable`] owned by their pool; lists link spans by
//! [`SpanId`] rather than by pointer, so every span is reachable from exactly
//! one owner.

use core::ptr::NonNull;
use std::collections::HashMap;

use crate::{NEEDS_ZEROING, PAGE_SHIFT, link};

/// Identity of a span: the index of its first page in the page heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(pub(crate) u32);

impl SpanId {
  #[inline]
  pub fn page(self) -> usize {
    self.0 as usize
  }
}

/// Which list of its pool a span is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListKind {
  /// Has at least one free object.
  Nonempty,
  /// Every object is allocated.
  Empty,
}

/// A run of pages carved into objects of one size class.
pub struct Span {
  id: SpanId,
  /// Address of the first page.
  start: usize,
  npages: usize,
  /// Buddy order of the block backing the span.
  order: u8,
  class: usize,
  object_size: usize,
  /// Objects carved out of the span.
  capacity: usize,
  /// End of the carved region.
  limit: usize,
  freelist: Option<NonNull<u8>>,
  /// One bit per carved slot, set while the slot is handed out.
  allocated: Box<[u64]>,
  /// Allocated objects.
  refs: usize,
  prev: Option<SpanId>,
  next: Option<SpanId>,
  list: Option<ListKind>,
}

// Span metadata is only touched under its owning pool's lock, or by whoever
// holds the span by value.
unsafe impl Send for Span {}

impl Span {
  pub(crate) fn new(id: SpanId, start: usize, npages: usize, order: u8, class: usize) -> Self {
    Self {
      id,
      start,
      npages,
      order,
      class,
      object_size: 0,
      capacity: 0,
      limit: start,
      freelist: None,
      allocated: Box::default(),
      refs: 0,
      prev: None,
      next: None,
      list: None,
    }
  }

  #[inline]
  pub fn id(&self) -> SpanId {
    self.id
  }

  #[inline]
  pub fn start(&self) -> usize {
    self.start
  }

  #[inline]
  pub fn npages(&self) -> usize {
    self.npages
  }

  #[inline]
  pub fn bytes(&self) -> usize {
    self.npages << PAGE_SHIFT
  }

  #[inline]
  pub fn class(&self) -> usize {
    self.class
  }

  #[inline]
  pub fn object_size(&self) -> usize {
    self.object_size
  }

  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[inline]
  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Allocated objects.
  #[inline]
  pub fn refs(&self) -> usize {
    self.refs
  }

  #[inline]
  pub(crate) fn order(&self) -> u8 {
    self.order
  }

  #[inline]
  pub(crate) fn list(&self) -> Option<ListKind> {
    self.list
  }

  #[inline]
  pub(crate) fn has_free(&self) -> bool {
    self.freelist.is_some()
  }

  /// True when `addr` is the first byte of a carved object.
  #[inline]
  pub(crate) fn is_object_start(&self, addr: usize) -> bool {
    addr >= self.start && addr < self.limit && (addr - self.start) % self.object_size == 0
  }

  #[inline]
  fn slot_of(&self, addr: usize) -> (usize, u64) {
    let slot = (addr - self.start) / self.object_size;
    (slot / 64, 1 << (slot % 64))
  }

  /// True when the object starting at `addr` is currently handed out.
  /// `addr` must be an object start.
  #[inline]
  pub(crate) fn is_allocated(&self, addr: usize) -> bool {
    let (word, bit) = self.slot_of(addr);
    self.allocated[word] & bit != 0
  }

  /// Objects whose allocated bit is set.
  pub(crate) fn allocated_count(&self) -> usize {
    self.allocated.iter().map(|w| w.count_ones() as usize).sum()
  }

  /// Threads `count` slots of `object_size` bytes into one free list, in
  /// address order.
  ///
  /// # Safety
  ///
  /// The span's pages must be mapped, writable and unreachable by anyone else,
  /// and `object_size * count` must fit in them.
  pub(crate) unsafe fn carve(&mut self, object_size: usize, count: usize) {
    debug_assert!(count > 0 && object_size * count <= self.bytes());
    self.object_size = object_size;
    self.capacity = count;
    self.limit = self.start + object_size * count;
    self.refs = 0;
    self.allocated = vec![0; count.div_ceil(64)].into_boxed_slice();

    let mut next = None;
    for i in (0..count).rev() {
      let slot = (self.start + i * object_size) as *mut u8;
      // SAFETY: the slot lies inside the span's pages.
      let slot = unsafe { NonNull::new_unchecked(slot) };
      unsafe { link::set_next(slot, next) };
      next = Some(slot);
    }
    self.freelist = next;
  }

  /// Takes the first free object and counts it as allocated.
  #[inline]
  pub(crate) fn pop_object(&mut self) -> Option<NonNull<u8>> {
    let obj = self.freelist?;
    // SAFETY: objects on the free list were linked by carve/push_object.
    self.freelist = unsafe { link::next(obj) };
    let (word, bit) = self.slot_of(obj.as_ptr() as usize);
    self.allocated[word] |= bit;
    self.refs += 1;
    Some(obj)
  }

  /// Puts `obj` back on the free list and drops one reference. Returns the
  /// remaining reference count.
  ///
  /// # Safety
  ///
  /// `obj` must be an allocated object of this span.
  #[inline]
  pub(crate) unsafe fn push_object(&mut self, obj: NonNull<u8>) -> usize {
    debug_assert!(self.refs > 0);
    let (word, bit) = self.slot_of(obj.as_ptr() as usize);
    debug_assert!(self.allocated[word] & bit != 0);
    self.allocated[word] &= !bit;
    unsafe { link::set_next(obj, self.freelist) };
    self.freelist = Some(obj);
    self.refs -= 1;
    self.refs
  }

  pub(crate) fn free_objects(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
    let mut cur = self.freelist;
    core::iter::from_fn(move || {
      let obj = cur?;
      // SAFETY: free list objects are linked by carve/push_object.
      cur = unsafe { link::next(obj) };
      Some(obj)
    })
  }

  /// Forgets the free list and flags the pages as dirty for the page heap.
  ///
  /// # Safety
  ///
  /// No object of the span may be in use.
  pub(crate) unsafe fn mark_needs_zeroing(&mut self) {
    debug_assert_eq!(self.refs, 0);
    self.freelist = None;
    unsafe { (self.start as *mut usize).write(NEEDS_ZEROING) };
  }
}

// =============================================================================
// Span table
// =============================================================================

/// Owned span metadata, keyed by id.
#[derive(Default)]
pub(crate) struct SpanTable {
  spans: HashMap<SpanId, Span>,
}

impl SpanTable {
  #[inline]
  pub(crate) fn get(&self, id: SpanId) -> Option<&Span> {
    self.spans.get(&id)
  }

  #[inline]
  pub(crate) fn get_mut(&mut self, id: SpanId) -> Option<&mut Span> {
    self.spans.get_mut(&id)
  }

  #[inline]
  fn span_mut(&mut self, id: SpanId) -> &mut Span {
    self.spans.get_mut(&id).expect("span list links a span missing from the table")
  }

  pub(crate) fn insert(&mut self, span: Span) {
    let previous = self.spans.insert(span.id, span);
    debug_assert!(previous.is_none());
  }

  pub(crate) fn remove(&mut self, id: SpanId) -> Option<Span> {
    self.spans.remove(&id)
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.spans.len()
  }

  pub(crate) fn ids(&self) -> impl Iterator<Item = SpanId> + '_ {
    self.spans.keys().copied()
  }

  pub(crate) fn values(&self) -> impl Iterator<Item = &Span> + '_ {
    self.spans.values()
  }
}

// =============================================================================
// Span list
// =============================================================================

/// Doubly-linked list of spans, threaded through the spans' `prev`/`next`.
pub(crate) struct SpanList {
  kind: ListKind,
  head: Option<SpanId>,
  len: usize,
}

impl SpanList {
  pub(crate) const fn new(kind: ListKind) -> Self {
    Self {
      kind,
      head: None,
      len: 0,
    }
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn first(&self) -> Option<SpanId> {
    self.head
  }

  /// Links `id` at the front of the list. The span must not be on any list.
  pub(crate) fn insert(&mut self, spans: &mut SpanTable, id: SpanId) {
    let old_head = self.head;
    {
      let span = spans.span_mut(id);
      debug_assert!(span.list.is_none(), "span {:?} is already listed", id);
      span.list = Some(self.kind);
      span.prev = None;
      span.next = old_head;
    }
    if let Some(h) = old_head {
      spans.span_mut(h).prev = Some(id);
    }
    self.head = Some(id);
    self.len += 1;
  }

  /// Unlinks `id`, which must be on this list.
  pub(crate) fn remove(&mut self, spans: &mut SpanTable, id: SpanId) {
    let (prev, next) = {
      let span = spans.span_mut(id);
      debug_assert_eq!(span.list, Some(self.kind));
      let links = (span.prev, span.next);
      span.prev = None;
      span.next = None;
      span.list = None;
      links
    };
    match prev {
      Some(p) => spans.span_mut(p).next = next,
      None => self.head = next,
    }
    if let Some(n) = next {
      spans.span_mut(n).prev = prev;
    }
    self.len -= 1;
  }

  /// Walks the list from the front.
  pub(crate) fn iter<'a>(&self, spans: &'a SpanTable) -> impl Iterator<Item = &'a Span> + 'a {
    let mut cur = self.head;
    core::iter::from_fn(move || {
      let span = spans.get(cur?)?;
      cur = span.next;
      Some(span)
    })
  }

  /// Checks back links and membership tags. Panics on the first mismatch.
  pub(crate) fn check_links(&self, spans: &SpanTable) -> usize {
    let mut prev = None;
    let mut count = 0;
    for span in self.iter(spans) {
      assert_eq!(span.list, Some(self.kind), "span {:?} tagged with the wrong list", span.id);
      assert_eq!(span.prev, prev, "span {:?} has a stale back link", span.id);
      prev = Some(span.id);
      count += 1;
      assert!(count <= spans.len(), "{:?} list is cyclic", self.kind);
    }
    assert_eq!(count, self.len, "{:?} list length is out of date", self.kind);
    count
  }
}
