use core::mem::{align_of, size_of};

use crate::{Error, MAX_SPAN_PAGES, PAGE_SIZE, align_up};

// =============================================================================
// Default geometry
// =============================================================================

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;
const CLASSES_MAX_SIZE: usize = 32 * 1024;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Target bytes moved per batch transfer.
const BATCH_BYTES: usize = 64 * 1024;
const BATCH_MIN: usize = 2;
const BATCH_MAX: usize = 32;

/// Convert class index to object size.
const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let size = align_up((base * GEO_MULTIPLIERS[sub]) / 16, 16);

    if size > CLASSES_MAX_SIZE {
      CLASSES_MAX_SIZE
    } else {
      size
    }
  }
}

/// Returns the total number of default size classes. Computed at compile-time.
const fn count_size_classes() -> usize {
  let mut class = 0;
  loop {
    if class_to_size(class) >= CLASSES_MAX_SIZE {
      return class + 1;
    }
    class += 1;
  }
}

const CLASSES_COUNT: usize = count_size_classes();

/// Smallest span (in pages) holding at least one object that wastes at most
/// 1/8 of its bytes on the tail.
const fn class_to_pages(size: usize) -> usize {
  let mut pages = size.div_ceil(PAGE_SIZE);
  while pages < MAX_SPAN_PAGES {
    let bytes = pages * PAGE_SIZE;
    if bytes % size <= bytes / 8 {
      break;
    }
    pages += 1;
  }
  pages
}

const _: () = assert!(class_to_size(0) == 16);
const _: () = assert!(class_to_pages(16) == 1);
const _: () = assert!(class_to_size(CLASSES_COUNT - 1) == CLASSES_MAX_SIZE);
const _: () = assert!(class_to_pages(CLASSES_MAX_SIZE) <= MAX_SPAN_PAGES);

// =============================================================================
// Table
// =============================================================================

/// Geometry of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassInfo {
  pub object_size: usize,
  pub span_pages: usize,
  pub objects_per_span: usize,
}

impl SizeClassInfo {
  #[inline]
  pub const fn span_bytes(&self) -> usize {
    self.span_pages * PAGE_SIZE
  }

  /// Objects a cache should move per refill or drain.
  pub const fn batch_size(&self) -> usize {
    let n = BATCH_BYTES / self.object_size;
    let n = if n < BATCH_MIN { BATCH_MIN } else { n };
    let n = if n > BATCH_MAX { BATCH_MAX } else { n };
    if n > self.objects_per_span {
      self.objects_per_span
    } else {
      n
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ClassGeometry {
  object_size: usize,
  span_pages: usize,
}

/// Read-only map from size-class id to `(object size, span pages)`.
#[derive(Clone, Debug)]
pub struct SizeClassTable {
  classes: Box<[ClassGeometry]>,
}

impl SizeClassTable {
  /// Builds a table from `(object_size, span_pages)` pairs, one per class.
  pub fn new(entries: &[(usize, usize)]) -> Result<Self, Error> {
    if entries.is_empty() {
      return Err(Error::EmptyTable);
    }
    let mut classes = Vec::with_capacity(entries.len());
    for (class, &(object_size, span_pages)) in entries.iter().enumerate() {
      let invalid = |reason| Error::InvalidGeometry { class, reason };
      if object_size < size_of::<usize>() {
        return Err(invalid("object size is smaller than a word"));
      }
      if object_size % align_of::<usize>() != 0 {
        return Err(invalid("object size is not word aligned"));
      }
      if span_pages == 0 {
        return Err(invalid("span has no pages"));
      }
      if span_pages > MAX_SPAN_PAGES {
        return Err(invalid("span has too many pages"));
      }
      if span_pages * PAGE_SIZE < object_size {
        return Err(invalid("span cannot hold a single object"));
      }
      classes.push(ClassGeometry {
        object_size,
        span_pages,
      });
    }
    Ok(Self {
      classes: classes.into_boxed_slice(),
    })
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.classes.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }

  /// Geometry for `class`. Panics on an id outside the table.
  #[inline]
  pub fn info(&self, class: usize) -> SizeClassInfo {
    let geometry = self.classes[class];
    SizeClassInfo {
      object_size: geometry.object_size,
      span_pages: geometry.span_pages,
      objects_per_span: (geometry.span_pages * PAGE_SIZE) / geometry.object_size,
    }
  }

  /// Smallest class whose objects hold `size` bytes.
  pub fn size_to_class(&self, size: usize) -> Option<usize> {
    let size = size.max(1);
    self.classes.iter().position(|c| c.object_size >= size)
  }
}

impl Default for SizeClassTable {
  fn default() -> Self {
    let classes = (0..CLASSES_COUNT)
      .map(|class| {
        let object_size = class_to_size(class);
        ClassGeometry {
          object_size,
          span_pages: class_to_pages(object_size),
        }
      })
      .collect();
    Self { classes }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_first_class_is_16_bytes_one_page() {
    let table = SizeClassTable::default();
    let info = table.info(0);
    assert_eq!(info.object_size, 16);
    assert_eq!(info.span_pages, 1);
    assert_eq!(info.objects_per_span, 512);
  }

  #[test]
  fn default_sizes_strictly_increase() {
    let table = SizeClassTable::default();
    assert_eq!(table.len(), CLASSES_COUNT);
    for class in 1..table.len() {
      assert!(
        table.info(class).object_size > table.info(class - 1).object_size,
        "class {class} does not grow"
      );
    }
    assert_eq!(table.info(table.len() - 1).object_size, CLASSES_MAX_SIZE);
  }

  #[test]
  fn default_waste_is_bounded() {
    let table = SizeClassTable::default();
    for class in 0..table.len() {
      let info = table.info(class);
      assert!(info.objects_per_span >= 1);
      let waste = info.span_bytes() - info.objects_per_span * info.object_size;
      assert!(waste <= info.span_bytes() / 8, "class {class} wastes {waste}");
    }
  }

  #[test]
  fn objects_per_span_is_computed() {
    let table = SizeClassTable::new(&[(48, 1), (1024, 2)]).unwrap();
    assert_eq!(table.info(0).objects_per_span, 8192 / 48);
    assert_eq!(table.info(1).objects_per_span, 16);
  }

  #[test]
  fn size_to_class_rounds_up() {
    let table = SizeClassTable::default();
    assert_eq!(table.size_to_class(0), Some(0));
    assert_eq!(table.size_to_class(16), Some(0));
    assert_eq!(table.size_to_class(17), Some(1));
    assert_eq!(table.size_to_class(129), Some(CLASSES_LINEAR));
    assert_eq!(table.size_to_class(CLASSES_MAX_SIZE), Some(CLASSES_COUNT - 1));
    assert_eq!(table.size_to_class(CLASSES_MAX_SIZE + 1), None);
  }

  #[test]
  fn rejects_bad_geometry() {
    assert_eq!(SizeClassTable::new(&[]).unwrap_err(), Error::EmptyTable);
    assert!(matches!(
      SizeClassTable::new(&[(4, 1)]),
      Err(Error::InvalidGeometry { class: 0, .. })
    ));
    assert!(matches!(
      SizeClassTable::new(&[(16, 1), (20, 1)]),
      Err(Error::InvalidGeometry { class: 1, .. })
    ));
    assert!(matches!(
      SizeClassTable::new(&[(16, 0)]),
      Err(Error::InvalidGeometry { .. })
    ));
    assert!(matches!(
      SizeClassTable::new(&[(3 * PAGE_SIZE, 2)]),
      Err(Error::InvalidGeometry { .. })
    ));
  }

  #[test]
  fn batch_size_is_clamped() {
    let table = SizeClassTable::default();
    assert_eq!(table.info(0).batch_size(), BATCH_MAX);
    let last = table.info(table.len() - 1);
    assert_eq!(last.batch_size(), BATCH_MIN.min(last.objects_per_span));
  }
}
