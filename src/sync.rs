//! Opt-in, per-instance locking.
//!
//! Every allocator holds a [`MutexSlot`]: no lock at all, a mutex borrowed
//! from the caller, or one it created itself (the `*_mutexed` constructors).
//! [`Guarded`] pairs that slot with the instance state and hands out the state
//! only while the lock is held.
//!
//! An instance without a mutex may still be reached from several threads
//! through `&self`. `Guarded` then refuses overlapping entry with a panic
//! instead of letting two callers touch the state at once.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::RawMutex as RawMutexApi;

// =============================================================================
// Mutex
// =============================================================================

/// Plain, non-recursive blocking mutex.
///
/// Unlike `std::sync::Mutex` it guards no data: it exists to be shared between
/// allocator instances and to expose the `lock` / `try_lock` / `unlock` triple.
pub struct Mutex {
  raw: parking_lot::RawMutex,
}

impl Mutex {
  pub const fn new() -> Self {
    Self {
      raw: <parking_lot::RawMutex as RawMutexApi>::INIT,
    }
  }

  #[inline]
  pub fn lock(&self) {
    self.raw.lock();
  }

  /// Returns `true` if the lock was acquired.
  #[inline]
  pub fn try_lock(&self) -> bool {
    self.raw.try_lock()
  }

  /// # Safety
  ///
  /// The calling thread must hold the lock, acquired through [`Mutex::lock`]
  /// or a successful [`Mutex::try_lock`].
  #[inline]
  pub unsafe fn unlock(&self) {
    unsafe { self.raw.unlock() };
  }

  #[inline]
  pub fn is_locked(&self) -> bool {
    self.raw.is_locked()
  }

  /// Locks and returns a guard that unlocks on drop.
  #[inline]
  pub fn guard(&self) -> MutexGuard<'_> {
    self.lock();
    MutexGuard { mutex: self }
  }
}

impl Default for Mutex {
  fn default() -> Self {
    Self::new()
  }
}

impl core::fmt::Debug for Mutex {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Mutex")
      .field("locked", &self.is_locked())
      .finish()
  }
}

#[must_use = "the mutex unlocks as soon as the guard is dropped"]
pub struct MutexGuard<'m> {
  mutex: &'m Mutex,
}

impl Drop for MutexGuard<'_> {
  fn drop(&mut self) {
    unsafe { self.mutex.unlock() };
  }
}

// =============================================================================
// Mutex slot
// =============================================================================

/// Which mutex, if any, an instance locks around its entry points.
#[derive(Debug, Default)]
pub enum MutexSlot<'a> {
  /// Single-threaded use only.
  #[default]
  Unlocked,
  /// Caller-supplied; outlives the instance.
  Borrowed(&'a Mutex),
  /// Created by a `*_mutexed` constructor, dropped with the instance.
  Owned(Box<Mutex>),
}

impl<'a> MutexSlot<'a> {
  pub const fn from_option(mutex: Option<&'a Mutex>) -> Self {
    match mutex {
      Some(m) => Self::Borrowed(m),
      None => Self::Unlocked,
    }
  }

  pub fn owned() -> Self {
    Self::Owned(Box::new(Mutex::new()))
  }

  pub fn get(&self) -> Option<&Mutex> {
    match self {
      Self::Unlocked => None,
      Self::Borrowed(m) => Some(m),
      Self::Owned(m) => Some(m),
    }
  }

  pub fn is_owned(&self) -> bool {
    matches!(self, Self::Owned(_))
  }

  #[inline]
  pub fn lock(&self) -> Option<MutexGuard<'_>> {
    self.get().map(Mutex::guard)
  }
}

// =============================================================================
// Guarded state
// =============================================================================

/// Instance state reachable only under the instance's mutex slot.
pub(crate) struct Guarded<'a, T> {
  mutex: MutexSlot<'a>,
  /// Set for the duration of `with`.
  busy: AtomicBool,
  state: UnsafeCell<T>,
}

// SAFETY: `with` hands out `&mut T` to one caller at a time: the mutex
// serialises callers, and `busy` turns any overlap that slips past an absent
// mutex (or a re-entrant call) into a panic before the state is touched.
unsafe impl<T: Send> Sync for Guarded<'_, T> {}

/// Clears the busy flag on exit, unwinding included.
struct Busy<'g>(&'g AtomicBool);

impl Drop for Busy<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl<'a, T> Guarded<'a, T> {
  pub(crate) const fn new(mutex: MutexSlot<'a>, state: T) -> Self {
    Self {
      mutex,
      busy: AtomicBool::new(false),
      state: UnsafeCell::new(state),
    }
  }

  /// Runs `f` on the state with the lock held for its whole duration.
  ///
  /// # Panics
  ///
  /// If another call is already inside `with` on the same instance: a second
  /// thread using an instance without a mutex, or `f` re-entering.
  #[inline]
  pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
    let _guard = self.mutex.lock();
    if self.busy.swap(true, Ordering::Acquire) {
      panic!("allocator state entered concurrently; give the instance a mutex to share it across threads");
    }
    let _busy = Busy(&self.busy);
    // SAFETY: `busy` was clear and is now held by this call alone.
    f(unsafe { &mut *self.state.get() })
  }

  #[inline]
  pub(crate) fn get_mut(&mut self) -> &mut T {
    self.state.get_mut()
  }

  pub(crate) fn mutex(&self) -> &MutexSlot<'a> {
    &self.mutex
  }
}
