//! Intrusive free-list links.
//!
//! A free object's first word holds the address of the next free object. This
//! module is the only place that reinterprets object memory as a link.

use core::ptr::{self, NonNull};

#[repr(C)]
struct FreeBlock {
  next: *mut FreeBlock,
}

/// Reads the link stored in `block`.
///
/// # Safety
///
/// `block` must point to a free object of at least one word, aligned for
/// `usize`, whose first word was last written by [`set_next`].
#[inline]
pub(crate) unsafe fn next(block: NonNull<u8>) -> Option<NonNull<u8>> {
  let block = block.cast::<FreeBlock>();
  NonNull::new(unsafe { ptr::read(ptr::addr_of!((*block.as_ptr()).next)) }.cast::<u8>())
}

/// Stores `next` as the link of `block`.
///
/// # Safety
///
/// `block` must point to writable memory of at least one word, aligned for
/// `usize`, that nobody else reads as object data.
#[inline]
pub(crate) unsafe fn set_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
  let block = block.cast::<FreeBlock>();
  let next = next.map_or(ptr::null_mut(), |n| n.as_ptr().cast::<FreeBlock>());
  unsafe { ptr::write(ptr::addr_of_mut!((*block.as_ptr()).next), next) };
}
