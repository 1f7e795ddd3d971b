use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set spin lock guarding a `T`.
///
/// Critical sections are short and never call into the page heap, so spinning
/// beats parking here.
pub struct SpinMutex<T> {
  locked: AtomicBool,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      data: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinGuard<'_, T> {
    self.raw_lock();
    SpinGuard { mutex: self }
  }

  #[inline]
  pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .ok()
      .map(|_| SpinGuard { mutex: self })
  }

  #[inline]
  fn raw_lock(&self) {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
  }

  #[inline]
  fn raw_unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

/// RAII guard for [`SpinMutex`]. Releases the lock on drop.
pub struct SpinGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> SpinGuard<'_, T> {
  /// Runs `f` with the lock released, then takes it back.
  ///
  /// The lock is re-acquired on every exit from `f`, unwinding included, so
  /// the guard's own drop always finds it held. `&mut self` keeps borrows of
  /// the protected data from living across the gap.
  pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
    struct Relock<'b, T>(&'b SpinMutex<T>);

    impl<T> Drop for Relock<'_, T> {
      fn drop(&mut self) {
        self.0.raw_lock();
      }
    }

    self.mutex.raw_unlock();
    let _relock = Relock(self.mutex);
    f()
  }
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.mutex.raw_unlock();
  }
}
