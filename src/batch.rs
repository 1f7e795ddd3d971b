use core::{fmt, ptr::NonNull};

use crate::link;

/// A chain of free objects of one size class, linked through their first words.
///
/// This is the unit moved between a cache and a [`CentralPool`](crate::CentralPool).
/// Objects are kept in insertion order for [`push_back`](Self::push_back) and
/// popped from the front. Dropping a non-empty batch leaks its objects.
#[must_use]
pub struct Batch {
  head: Option<NonNull<u8>>,
  tail: Option<NonNull<u8>>,
  len: usize,
}

// The chain is plain memory owned by whoever holds the batch.
unsafe impl Send for Batch {}

impl Batch {
  pub const fn new() -> Self {
    Self {
      head: None,
      tail: None,
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  /// First object of the chain.
  #[inline]
  pub fn head(&self) -> Option<NonNull<u8>> {
    self.head
  }

  /// Removes the first object. Its first word still holds a stale link.
  #[inline]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let head = self.head?;
    // SAFETY: every object in the chain was linked by push/push_back.
    self.head = unsafe { link::next(head) };
    if self.head.is_none() {
      self.tail = None;
    }
    self.len -= 1;
    Some(head)
  }

  /// Prepends `obj`.
  ///
  /// # Safety
  ///
  /// `obj` must be a free object of at least one aligned word, not already in
  /// any chain, and must not be accessed by the caller while in the batch.
  #[inline]
  pub unsafe fn push(&mut self, obj: NonNull<u8>) {
    unsafe { link::set_next(obj, self.head) };
    if self.tail.is_none() {
      self.tail = Some(obj);
    }
    self.head = Some(obj);
    self.len += 1;
  }

  /// Appends `obj`.
  ///
  /// # Safety
  ///
  /// Same contract as [`push`](Self::push).
  #[inline]
  pub unsafe fn push_back(&mut self, obj: NonNull<u8>) {
    unsafe { link::set_next(obj, None) };
    match self.tail {
      Some(tail) => unsafe { link::set_next(tail, Some(obj)) },
      None => self.head = Some(obj),
    }
    self.tail = Some(obj);
    self.len += 1;
  }

  /// Splices `other` onto the end of this chain.
  pub fn append(&mut self, mut other: Batch) {
    let Some(other_head) = other.head.take() else {
      return;
    };
    match self.tail {
      // SAFETY: `tail` is the last object of a valid chain.
      Some(tail) => unsafe { link::set_next(tail, Some(other_head)) },
      None => self.head = Some(other_head),
    }
    self.tail = other.tail.take();
    self.len += core::mem::take(&mut other.len);
  }

  /// Detaches up to `n` objects from the front into a new batch.
  pub fn split_front(&mut self, n: usize) -> Batch {
    let mut front = Batch::new();
    for _ in 0..n {
      let Some(obj) = self.pop() else {
        break;
      };
      // SAFETY: `obj` just left this chain.
      unsafe { front.push_back(obj) };
    }
    front
  }

  /// Iterates the addresses in the chain without consuming it.
  pub fn iter(&self) -> BatchIter<'_> {
    BatchIter {
      next: self.head,
      _batch: self,
    }
  }
}

impl Default for Batch {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Debug for Batch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Batch")
      .field("head", &self.head)
      .field("len", &self.len)
      .finish()
  }
}

/// Borrowing iterator over the objects of a [`Batch`].
pub struct BatchIter<'a> {
  next: Option<NonNull<u8>>,
  _batch: &'a Batch,
}

impl Iterator for BatchIter<'_> {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<NonNull<u8>> {
    let cur = self.next?;
    // SAFETY: the borrowed batch keeps the chain intact.
    self.next = unsafe { link::next(cur) };
    Some(cur)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn slots(words: &mut [usize]) -> Vec<NonNull<u8>> {
    words
      .iter_mut()
      .map(|w| NonNull::from(w).cast::<u8>())
      .collect()
  }

  #[test]
  fn push_back_keeps_order() {
    let mut words = [0usize; 4];
    let objs = slots(&mut words);
    let mut batch = Batch::new();
    for &o in &objs {
      unsafe { batch.push_back(o) };
    }
    assert_eq!(batch.len(), 4);
    assert_eq!(batch.iter().collect::<Vec<_>>(), objs);
    assert_eq!(batch.pop(), Some(objs[0]));
    assert_eq!(batch.len(), 3);
  }

  #[test]
  fn push_is_lifo() {
    let mut words = [0usize; 2];
    let objs = slots(&mut words);
    let mut batch = Batch::new();
    unsafe {
      batch.push(objs[0]);
      batch.push(objs[1]);
    }
    assert_eq!(batch.pop(), Some(objs[1]));
    assert_eq!(batch.pop(), Some(objs[0]));
    assert_eq!(batch.pop(), None);
    assert!(batch.is_empty());
    assert_eq!(batch.len(), 0);
  }

  #[test]
  fn append_and_split() {
    let mut words = [0usize; 5];
    let objs = slots(&mut words);
    let mut a = Batch::new();
    let mut b = Batch::new();
    unsafe {
      a.push_back(objs[0]);
      a.push_back(objs[1]);
      b.push_back(objs[2]);
      b.push_back(objs[3]);
      b.push_back(objs[4]);
    }
    a.append(b);
    assert_eq!(a.len(), 5);
    assert_eq!(a.iter().collect::<Vec<_>>(), objs);

    let front = a.split_front(2);
    assert_eq!(front.iter().collect::<Vec<_>>(), &objs[..2]);
    assert_eq!(a.iter().collect::<Vec<_>>(), &objs[2..]);

    let rest = a.split_front(10);
    assert_eq!(rest.len(), 3);
    assert!(a.is_empty());
  }

  #[test]
  fn append_to_empty() {
    let mut words = [0usize; 1];
    let objs = slots(&mut words);
    let mut a = Batch::new();
    let mut b = Batch::new();
    unsafe { b.push(objs[0]) };
    a.append(b);
    assert_eq!(a.head(), Some(objs[0]));
    assert_eq!(a.len(), 1);
  }
}
