use thiserror::Error;

/// Errors raised while building a heap or a size-class table.
///
/// Running out of pages is not an error: the batch API reports it as an
/// empty [`Batch`](crate::Batch).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
  #[error("mmap refused to reserve {bytes} bytes")]
  ReserveFailed { bytes: usize },

  #[error("page heap needs at least one page")]
  HeapTooSmall,

  #[error("page heap of {pages} pages exceeds the page map range")]
  HeapTooLarge { pages: usize },

  #[error("size-class table is empty")]
  EmptyTable,

  #[error("size class {class}: {reason}")]
  InvalidGeometry { class: usize, reason: &'static str },
}
