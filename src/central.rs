//! Central free lists.
//!
//! A central pool does not hold free objects itself; its spans do. Each pool
//! keeps two span lists: spans with free objects (`nonempty`) and spans whose
//! objects are all allocated (`empty`). Objects move to and from caches in
//! batches under the pool's lock. Page heap calls are always made with that
//! lock released.

use core::ptr::NonNull;

use log::{debug, error, trace};

use crate::{
  Batch, PageHeap, SizeClassInfo, SizeClassTable, SpinGuard, SpinMutex,
  span::{ListKind, Span, SpanId, SpanList, SpanTable},
};

// =============================================================================
// Pool state
// =============================================================================

struct PoolState {
  nonempty: SpanList,
  empty: SpanList,
  spans: SpanTable,
  /// Free objects across all owned spans.
  nfree: usize,
}

impl PoolState {
  fn new() -> Self {
    Self {
      nonempty: SpanList::new(ListKind::Nonempty),
      empty: SpanList::new(ListKind::Empty),
      spans: SpanTable::default(),
      nfree: 0,
    }
  }

  /// Moves a span onto the `to` list, unlinking it from wherever it is.
  fn relist(&mut self, id: SpanId, to: ListKind) {
    let from = self.spans.get(id).and_then(Span::list);
    if from == Some(to) {
      return;
    }
    if let Some(from) = from {
      let Self {
        nonempty,
        empty,
        spans,
        ..
      } = self;
      match from {
        ListKind::Nonempty => nonempty.remove(spans, id),
        ListKind::Empty => empty.remove(spans, id),
      }
    }
    let Self {
      nonempty,
      empty,
      spans,
      ..
    } = self;
    match to {
      ListKind::Nonempty => nonempty.insert(spans, id),
      ListKind::Empty => empty.insert(spans, id),
    }
  }

  /// Takes one object from the first nonempty span.
  fn alloc_one(&mut self) -> Option<NonNull<u8>> {
    let id = self.nonempty.first()?;
    let span = self.spans.get_mut(id)?;
    let obj = span.pop_object()?;
    let drained = !span.has_free();
    self.nfree -= 1;
    if drained {
      self.relist(id, ListKind::Empty);
    }
    Some(obj)
  }

  /// Unlinks a span from its list and the table.
  fn take_span(&mut self, id: SpanId) -> Option<Span> {
    if let Some(kind) = self.spans.get(id).and_then(Span::list) {
      let Self {
        nonempty,
        empty,
        spans,
        ..
      } = self;
      match kind {
        ListKind::Nonempty => nonempty.remove(spans, id),
        ListKind::Empty => empty.remove(spans, id),
      }
    }
    self.spans.remove(id)
  }

  fn stats(&self) -> PoolStats {
    PoolStats {
      spans: self.spans.len(),
      nonempty_spans: self.nonempty.len(),
      empty_spans: self.empty.len(),
      free_objects: self.nfree,
      live_objects: self.spans.values().map(Span::refs).sum(),
    }
  }
}

/// Snapshot of a pool's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
  pub spans: usize,
  pub nonempty_spans: usize,
  pub empty_spans: usize,
  pub free_objects: usize,
  pub live_objects: usize,
}

// =============================================================================
// Central pool
// =============================================================================

/// Central free list for one size class.
pub struct CentralPool {
  class: usize,
  info: SizeClassInfo,
  state: SpinMutex<PoolState>,
}

impl CentralPool {
  pub fn new(class: usize, info: SizeClassInfo) -> Self {
    Self {
      class,
      info,
      state: SpinMutex::new(PoolState::new()),
    }
  }

  #[inline]
  pub fn class(&self) -> usize {
    self.class
  }

  #[inline]
  pub fn info(&self) -> SizeClassInfo {
    self.info
  }

  /// Allocates up to `count` objects, linked together by their first words in
  /// the order they left their spans.
  ///
  /// Returns an empty batch only when the page heap has no span to give. Once
  /// one object is granted, running dry later returns a short batch.
  #[must_use]
  pub fn allocate_batch(&self, heap: &PageHeap, count: usize) -> Batch {
    let mut batch = Batch::new();
    if count == 0 {
      return batch;
    }

    let mut state = self.state.lock();
    while batch.len() < count {
      if state.nonempty.is_empty() && !self.grow(heap, &mut state) {
        break;
      }
      // Another thread may have drained the new span while we were unlocked.
      let Some(obj) = state.alloc_one() else {
        continue;
      };
      // SAFETY: `obj` just left a span's free list and is ours alone.
      unsafe { batch.push_back(obj) };
    }

    if batch.is_empty() {
      debug!("class {}: page heap exhausted", self.class);
    }
    self.tripwire(&state);
    batch
  }

  /// Returns every object of `batch` to its span, handing spans that become
  /// completely free back to the page heap.
  ///
  /// Panics with "invalid free" when an object does not belong to a live span
  /// of this pool.
  pub fn free_batch(&self, heap: &PageHeap, mut batch: Batch) {
    let mut state = self.state.lock();
    while let Some(obj) = batch.pop() {
      self.free_one(heap, &mut state, obj);
    }
    self.tripwire(&state);
  }

  fn free_one(&self, heap: &PageHeap, state: &mut SpinGuard<'_, PoolState>, obj: NonNull<u8>) {
    let addr = obj.as_ptr() as usize;

    // Find span for obj.
    let Some(id) = heap.lookup_span(addr) else {
      invalid_free(self.class, addr, "address is not in any span");
    };
    let Some(span) = state.spans.get(id) else {
      invalid_free(self.class, addr, "span belongs to another size class");
    };
    if span.refs() == 0 {
      invalid_free(self.class, addr, "span has no allocated objects");
    }
    if !span.is_object_start(addr) {
      invalid_free(self.class, addr, "address is not an object boundary");
    }
    if !span.is_allocated(addr) {
      invalid_free(self.class, addr, "object is already free");
    }

    // Move to nonempty if necessary.
    if !span.has_free() {
      state.relist(id, ListKind::Nonempty);
    }

    let Some(span) = state.spans.get_mut(id) else {
      unreachable!("span {id:?} vanished while locked");
    };
    // SAFETY: validated above as an allocated object of this span.
    let refs = unsafe { span.push_object(obj) };
    state.nfree += 1;
    if refs > 0 {
      return;
    }

    // Completely freed: return it to the heap.
    let Some(mut span) = state.take_span(id) else {
      unreachable!("span {id:?} vanished while locked");
    };
    heap.mark_free(span.start(), span.bytes());
    // SAFETY: refs is zero and the span is off every list.
    unsafe { span.mark_needs_zeroing() };
    state.nfree -= span.capacity();
    trace!("class {}: span {:?} fully free, returning to heap", self.class, id);
    state.unlocked(|| heap.release_span(span));
  }

  /// Fetches a new span from the heap and carves it into objects.
  fn grow(&self, heap: &PageHeap, state: &mut SpinGuard<'_, PoolState>) -> bool {
    let SizeClassInfo {
      object_size,
      span_pages,
      objects_per_span,
    } = self.info;

    let span = state.unlocked(|| {
      let mut span = heap.allocate_span(span_pages, self.class)?;
      // SAFETY: the span is fresh from the heap and reachable only from here.
      unsafe { span.carve(object_size, objects_per_span) };
      heap.mark_allocated(
        span.start(),
        object_size,
        objects_per_span,
        object_size * objects_per_span < span.bytes(),
      );
      Some(span)
    });
    let Some(span) = span else {
      return false;
    };

    let id = span.id();
    trace!(
      "class {}: grew span {:?} with {} objects",
      self.class, id, objects_per_span
    );
    state.nfree += objects_per_span;
    state.spans.insert(span);
    let PoolState {
      nonempty, spans, ..
    } = &mut **state;
    nonempty.insert(spans, id);
    true
  }

  /// Free objects currently held by the pool's spans.
  pub fn free_objects(&self) -> usize {
    self.state.lock().nfree
  }

  pub fn stats(&self) -> PoolStats {
    self.state.lock().stats()
  }

  /// Spans owned by this pool.
  pub fn span_ids(&self) -> Vec<SpanId> {
    let state = self.state.lock();
    let mut ids: Vec<SpanId> = state.spans.ids().collect();
    ids.sort_unstable();
    ids
  }

  /// Walks both lists and every span's free list. Panics on the first broken
  /// invariant, otherwise returns the pool's stats.
  pub fn check_invariants(&self) -> PoolStats {
    let state = self.state.lock();
    Self::check_state(self.class, self.info, &state);
    state.stats()
  }

  fn check_state(class: usize, info: SizeClassInfo, state: &PoolState) {
    let listed = state.nonempty.check_links(&state.spans) + state.empty.check_links(&state.spans);
    assert_eq!(listed, state.spans.len(), "class {class}: unlisted spans");

    let mut free = 0;
    for span in state.spans.values() {
      assert_eq!(span.class(), class, "span {:?} has a foreign class", span.id());
      assert_eq!(span.object_size(), info.object_size);
      assert!(span.refs() > 0 || span.has_free(), "span {:?} holds no objects", span.id());
      let expected = if span.has_free() {
        ListKind::Nonempty
      } else {
        ListKind::Empty
      };
      assert_eq!(span.list(), Some(expected), "span {:?} is on the wrong list", span.id());

      let span_free = span.free_objects().count();
      assert_eq!(
        span_free + span.refs(),
        span.capacity(),
        "span {:?} lost objects",
        span.id()
      );
      assert_eq!(
        span.allocated_count(),
        span.refs(),
        "span {:?} allocated bits disagree with refs",
        span.id()
      );
      free += span_free;
    }
    assert_eq!(free, state.nfree, "class {class}: free counter drifted");
  }

  #[inline]
  fn tripwire(&self, _state: &PoolState) {
    #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
    {
      Self::check_state(self.class, self.info, _state);
    }
  }
}

#[cold]
#[inline(never)]
fn invalid_free(class: usize, addr: usize, reason: &str) -> ! {
  error!("class {class}: invalid free of {addr:#x}: {reason}");
  panic!("invalid free of {addr:#x} in class {class}: {reason}");
}

// =============================================================================
// Central pools
// =============================================================================

/// One central pool per size class, sharing one page heap.
pub struct CentralPools {
  heap: PageHeap,
  table: SizeClassTable,
  pools: Box<[CentralPool]>,
}

impl CentralPools {
  pub fn new(heap: PageHeap, table: SizeClassTable) -> Self {
    let pools = (0..table.len())
      .map(|class| CentralPool::new(class, table.info(class)))
      .collect();
    Self { heap, table, pools }
  }

  #[inline]
  pub fn heap(&self) -> &PageHeap {
    &self.heap
  }

  #[inline]
  pub fn table(&self) -> &SizeClassTable {
    &self.table
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.pools.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.pools.is_empty()
  }

  /// Pool for `class`. Panics on an id outside the table.
  #[inline]
  pub fn pool(&self, class: usize) -> &CentralPool {
    &self.pools[class]
  }

  /// Geometry of `class`.
  #[inline]
  pub fn size_class_info(&self, class: usize) -> SizeClassInfo {
    self.table.info(class)
  }

  #[must_use]
  pub fn allocate_batch(&self, class: usize, count: usize) -> Batch {
    self.pools[class].allocate_batch(&self.heap, count)
  }

  pub fn free_batch(&self, class: usize, batch: Batch) {
    self.pools[class].free_batch(&self.heap, batch)
  }

  /// Checks every pool, then that no span is listed by two pools.
  pub fn check_invariants(&self) {
    let mut seen = Vec::new();
    for pool in self.pools.iter() {
      pool.check_invariants();
      seen.extend(pool.span_ids().into_iter().map(|id| (id, pool.class())));
    }
    seen.sort_unstable();
    for pair in seen.windows(2) {
      assert_ne!(
        pair[0].0, pair[1].0,
        "span {:?} owned by classes {} and {}",
        pair[0].0, pair[0].1, pair[1].1
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::PAGE_SIZE;

  fn pools(pages: usize, geometry: &[(usize, usize)]) -> CentralPools {
    CentralPools::new(
      PageHeap::new(pages).unwrap(),
      SizeClassTable::new(geometry).unwrap(),
    )
  }

  #[test]
  fn first_allocation_grows_once() {
    let pools = pools(8, &[(16, 1)]);
    let batch = pools.allocate_batch(0, 10);
    assert_eq!(batch.len(), 10);
    assert_eq!(pools.heap().spans_granted(), 1);
    assert_eq!(pools.pool(0).free_objects(), 502);
    let stats = pools.pool(0).check_invariants();
    assert_eq!(stats.live_objects, 10);
    assert_eq!(stats.nonempty_spans, 1);
  }

  #[test]
  fn chain_is_in_removal_order() {
    let pools = pools(8, &[(64, 1)]);
    let batch = pools.allocate_batch(0, 4);
    let addrs: Vec<usize> = batch.iter().map(|p| p.as_ptr() as usize).collect();
    let base = addrs[0];
    assert_eq!(addrs, [base, base + 64, base + 128, base + 192]);
    pools.free_batch(0, batch);
  }

  #[test]
  fn drained_span_moves_to_empty() {
    let pools = pools(8, &[(PAGE_SIZE / 4, 1)]);
    let batch = pools.allocate_batch(0, 4);
    assert_eq!(batch.len(), 4);
    let stats = pools.pool(0).check_invariants();
    assert_eq!(stats.empty_spans, 1);
    assert_eq!(stats.nonempty_spans, 0);
    assert_eq!(stats.free_objects, 0);
    assert_eq!(pools.heap().spans_granted(), 1);

    let mut batch = batch;
    let one = batch.split_front(1);
    pools.free_batch(0, one);
    let stats = pools.pool(0).check_invariants();
    assert_eq!(stats.nonempty_spans, 1);
    assert_eq!(stats.empty_spans, 0);
    assert_eq!(stats.free_objects, 1);
    pools.free_batch(0, batch);
  }

  #[test]
  fn zero_count_is_a_no_op() {
    let pools = pools(1, &[(16, 1)]);
    assert!(pools.allocate_batch(0, 0).is_empty());
    assert_eq!(pools.heap().spans_granted(), 0);
  }

  #[test]
  fn exhausted_heap_grants_nothing() {
    let pools = pools(1, &[(16, 2)]);
    let batch = pools.allocate_batch(0, 8);
    assert!(batch.is_empty());
    assert_eq!(pools.pool(0).check_invariants(), PoolStats::default());
  }

  #[test]
  fn full_free_returns_span_to_heap() {
    let pools = pools(4, &[(1024, 1)]);
    let batch = pools.allocate_batch(0, 8);
    let start = batch.head().unwrap().as_ptr() as usize;
    pools.free_batch(0, batch);
    assert_eq!(pools.heap().spans_released(), 1);
    assert_eq!(pools.heap().pages_in_use(), 0);
    assert_eq!(pools.heap().lookup_span(start), None);
    assert_eq!(pools.heap().page_mark(start), crate::PageMark::Free);
    assert_eq!(pools.pool(0).check_invariants(), PoolStats::default());
  }

  #[test]
  fn grown_span_is_marked_live() {
    let pools = pools(4, &[(48, 1), (16, 1)]);
    let partial = pools.allocate_batch(0, 1);
    let exact = pools.allocate_batch(1, 1);
    let heap = pools.heap();
    assert_eq!(
      heap.page_mark(partial.head().unwrap().as_ptr() as usize),
      crate::PageMark::LivePartial
    );
    assert_eq!(
      heap.page_mark(exact.head().unwrap().as_ptr() as usize),
      crate::PageMark::Live
    );
    pools.free_batch(0, partial);
    pools.free_batch(1, exact);
  }

  #[test]
  #[cfg(all(debug_assertions, feature = "debug-tripwire"))]
  fn tripwire_accepts_a_consistent_workload() {
    let pools = pools(8, &[(32, 1)]);
    let mut held = pools.allocate_batch(0, 300);
    for round in 0..20 {
      let back = held.split_front(round * 7 % 40);
      pools.free_batch(0, back);
      held.append(pools.allocate_batch(0, 1 + round % 13));
    }
    pools.free_batch(0, held);
    assert_eq!(pools.heap().pages_in_use(), 0);
  }

  #[test]
  #[should_panic(expected = "invalid free")]
  fn freeing_into_the_wrong_class_is_fatal() {
    let pools = pools(4, &[(16, 1), (32, 1)]);
    let batch = pools.allocate_batch(0, 1);
    pools.free_batch(1, batch);
  }

  #[test]
  #[should_panic(expected = "invalid free")]
  fn freeing_a_slot_never_handed_out_is_fatal() {
    let pools = pools(4, &[(64, 1)]);
    let batch = pools.allocate_batch(0, 1);
    let slot5 = unsafe { batch.head().unwrap().add(5 * 64) };
    let mut bogus = Batch::new();
    unsafe { bogus.push(slot5) };
    pools.free_batch(0, bogus);
  }

  #[test]
  #[should_panic(expected = "invalid free")]
  fn freeing_mid_object_is_fatal() {
    let pools = pools(4, &[(64, 1)]);
    let batch = pools.allocate_batch(0, 2);
    let inner = unsafe { batch.head().unwrap().add(8) };
    let mut bogus = Batch::new();
    unsafe { bogus.push(inner) };
    pools.free_batch(0, bogus);
  }
}
