use core::ptr::NonNull;

use crate::{Batch, CentralPools};

/// Single-owner object cache in front of the central pools.
///
/// Keeps one chain of free objects per size class. Misses refill a whole
/// batch from the central pool; overflow drains half of the chain back.
pub struct LocalCache<'a> {
  pools: &'a CentralPools,
  lists: Box<[Batch]>,
}

impl<'a> LocalCache<'a> {
  pub fn new(pools: &'a CentralPools) -> Self {
    Self {
      pools,
      lists: (0..pools.len()).map(|_| Batch::new()).collect(),
    }
  }

  /// Takes an object of `class`, or `None` when the page heap is exhausted.
  pub fn alloc(&mut self, class: usize) -> Option<NonNull<u8>> {
    if let Some(obj) = self.lists[class].pop() {
      return Some(obj);
    }
    let want = self.pools.size_class_info(class).batch_size();
    let refill = self.pools.allocate_batch(class, want);
    self.lists[class].append(refill);
    self.lists[class].pop()
  }

  /// Takes an object big enough for `size` bytes.
  pub fn alloc_size(&mut self, size: usize) -> Option<NonNull<u8>> {
    let class = self.pools.table().size_to_class(size)?;
    self.alloc(class)
  }

  /// Gives back an object of `class`.
  ///
  /// # Safety
  ///
  /// `obj` must come from [`alloc`](Self::alloc) (or the central pool) for the
  /// same `class`, and must not be used afterwards.
  pub unsafe fn dealloc(&mut self, class: usize, obj: NonNull<u8>) {
    let list = &mut self.lists[class];
    unsafe { list.push(obj) };

    let batch = self.pools.size_class_info(class).batch_size();
    if list.len() > 2 * batch {
      let excess = list.split_front(list.len() / 2);
      self.pools.free_batch(class, excess);
    }
  }

  /// Objects cached for `class`.
  #[inline]
  pub fn cached(&self, class: usize) -> usize {
    self.lists[class].len()
  }

  /// Returns every cached object to the central pools.
  pub fn flush(&mut self) {
    for (class, list) in self.lists.iter_mut().enumerate() {
      if !list.is_empty() {
        self.pools.free_batch(class, core::mem::take(list));
      }
    }
  }
}

impl Drop for LocalCache<'_> {
  fn drop(&mut self) {
    self.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{PageHeap, SizeClassTable};

  fn pools() -> CentralPools {
    CentralPools::new(PageHeap::new(64).unwrap(), SizeClassTable::default())
  }

  #[test]
  fn miss_refills_a_batch() {
    let pools = pools();
    let mut cache = LocalCache::new(&pools);
    let batch = pools.size_class_info(0).batch_size();
    let obj = cache.alloc(0).unwrap();
    assert_eq!(cache.cached(0), batch - 1);
    assert_eq!(pools.pool(0).free_objects(), 512 - batch);
    unsafe { cache.dealloc(0, obj) };
    assert_eq!(cache.cached(0), batch);
  }

  #[test]
  fn overflow_drains_half() {
    let pools = pools();
    let mut cache = LocalCache::new(&pools);
    let batch = pools.size_class_info(0).batch_size();
    let objs: Vec<_> = (0..3 * batch).map(|_| cache.alloc(0).unwrap()).collect();
    assert_eq!(cache.cached(0), 0);
    for obj in objs {
      unsafe { cache.dealloc(0, obj) };
      assert!(cache.cached(0) <= 2 * batch);
    }
    pools.check_invariants();
  }

  #[test]
  fn drop_flushes_everything() {
    let pools = pools();
    {
      let mut cache = LocalCache::new(&pools);
      let a = cache.alloc_size(100).unwrap();
      let b = cache.alloc_size(5000).unwrap();
      unsafe {
        cache.dealloc(pools.table().size_to_class(100).unwrap(), a);
        cache.dealloc(pools.table().size_to_class(5000).unwrap(), b);
      }
    }
    pools.check_invariants();
    assert_eq!(pools.heap().pages_in_use(), 0);
  }

  #[test]
  fn oversized_request_has_no_class() {
    let pools = pools();
    let mut cache = LocalCache::new(&pools);
    assert!(cache.alloc_size(1 << 20).is_none());
  }
}
