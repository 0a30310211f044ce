//! The allocator interface shared by every component.
//!
//! A concrete allocator implements [`RawAllocator`]; consumers hold an
//! [`Allocator`], a copyable handle that borrows it. Handles compare equal when
//! they point at the same instance, and [`Allocator::null`] stands for "no
//! parent": it fails every allocation and ignores every release.
//!
//! ```text
//!   Pool ──┐
//!   Heap ──┼──► Allocator<'a> ──► &dyn RawAllocator ──► Arena ──► ... ──► VirtualMemory
//!   Ring ──┘
//! ```

use core::fmt;
use core::mem::{align_of, size_of};
use core::panic::Location;
use core::ptr;

/// Minimum alignment of every pointer handed out through an [`Allocator`].
pub const MIN_ALIGN: usize = align_of::<usize>();

// =============================================================================
// Call site
// =============================================================================

/// Where an allocation was requested from. Carried through every allocator
/// layer for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
  pub file: &'static str,
  pub line: u32,
  pub column: u32,
}

impl CallSite {
  #[track_caller]
  #[inline]
  pub fn here() -> Self {
    Self::from(Location::caller())
  }
}

impl From<&'static Location<'static>> for CallSite {
  fn from(loc: &'static Location<'static>) -> Self {
    Self {
      file: loc.file(),
      line: loc.line(),
      column: loc.column(),
    }
  }
}

impl fmt::Display for CallSite {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.file, self.line, self.column)
  }
}

// =============================================================================
// RawAllocator
// =============================================================================

/// Allocation strategy behind an [`Allocator`] handle.
///
/// Implementations never panic on exhaustion: they return null. Returned
/// pointers are aligned to at least [`MIN_ALIGN`].
///
/// Handles are shared by every child stacked on the allocator, possibly from
/// several threads, hence the `Sync` bound.
pub trait RawAllocator: Sync {
  /// At least `size` writable bytes, or null. A zero `size` may return null or
  /// a unique pointer that must not be dereferenced.
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8;

  /// Returns `ptr` to the allocator. Null is a no-op; `size` is advisory.
  fn dealloc(&self, ptr: *mut u8, size: usize, site: CallSite);

  /// Resizes `ptr` to `new_size`, keeping `min(old_size, new_size)` bytes.
  /// On failure the old pointer stays valid and null is returned.
  ///
  /// The provided method allocates, copies and releases the old block.
  fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize, site: CallSite) -> *mut u8 {
    let new_ptr = self.alloc(new_size, site);
    if !new_ptr.is_null() && !ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
      self.dealloc(ptr, old_size, site);
    }
    new_ptr
  }
}

// =============================================================================
// Allocator handle
// =============================================================================

/// Copyable handle over a [`RawAllocator`]. All entry points record the
/// caller's location.
#[derive(Clone, Copy, Default)]
pub struct Allocator<'a> {
  inner: Option<&'a dyn RawAllocator>,
}

impl<'a> Allocator<'a> {
  pub const fn new(inner: &'a dyn RawAllocator) -> Self {
    Self { inner: Some(inner) }
  }

  /// The "no parent" handle.
  pub const fn null() -> Self {
    Self { inner: None }
  }

  pub const fn is_null(&self) -> bool {
    self.inner.is_none()
  }

  #[track_caller]
  #[inline]
  pub fn alloc(&self, size: usize) -> *mut u8 {
    self.alloc_at(size, CallSite::here())
  }

  #[track_caller]
  #[inline]
  pub fn dealloc(&self, ptr: *mut u8, size: usize) {
    self.dealloc_at(ptr, size, CallSite::here())
  }

  #[track_caller]
  #[inline]
  pub fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    self.realloc_at(ptr, old_size, new_size, CallSite::here())
  }

  /// `count * size` zeroed bytes, or null (also on overflow).
  #[track_caller]
  #[inline]
  pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
    self.calloc_at(count, size, CallSite::here())
  }

  pub fn alloc_at(&self, size: usize, site: CallSite) -> *mut u8 {
    match self.inner {
      Some(a) => a.alloc(size, site),
      None => ptr::null_mut(),
    }
  }

  pub fn dealloc_at(&self, ptr: *mut u8, size: usize, site: CallSite) {
    if ptr.is_null() {
      return;
    }
    if let Some(a) = self.inner {
      a.dealloc(ptr, size, site);
    }
  }

  pub fn realloc_at(&self, ptr: *mut u8, old_size: usize, new_size: usize, site: CallSite) -> *mut u8 {
    match self.inner {
      Some(a) => a.realloc(ptr, old_size, new_size, site),
      None => ptr::null_mut(),
    }
  }

  pub fn calloc_at(&self, count: usize, size: usize, site: CallSite) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      return ptr::null_mut();
    };
    let p = self.alloc_at(total, site);
    if !p.is_null() {
      unsafe { ptr::write_bytes(p, 0, total) };
    }
    p
  }

  // ---------------------------------------------------------------------------
  // Typed helpers
  // ---------------------------------------------------------------------------

  /// Uninitialised storage for one `T`. Null when `T` needs more than
  /// [`MIN_ALIGN`], which the handle cannot promise.
  #[track_caller]
  pub fn alloc_type<T>(&self) -> *mut T {
    self.alloc_array::<T>(1)
  }

  #[track_caller]
  pub fn alloc_array<T>(&self, count: usize) -> *mut T {
    if align_of::<T>() > MIN_ALIGN {
      return ptr::null_mut();
    }
    match size_of::<T>().checked_mul(count) {
      Some(total) => self.alloc_at(total, CallSite::here()).cast(),
      None => ptr::null_mut(),
    }
  }

  #[track_caller]
  pub fn realloc_array<T>(&self, ptr: *mut T, old_count: usize, new_count: usize) -> *mut T {
    if align_of::<T>() > MIN_ALIGN {
      return ptr::null_mut();
    }
    let (Some(old), Some(new)) = (
      size_of::<T>().checked_mul(old_count),
      size_of::<T>().checked_mul(new_count),
    ) else {
      return ptr::null_mut();
    };
    self.realloc_at(ptr.cast(), old, new, CallSite::here()).cast()
  }

  #[track_caller]
  pub fn dealloc_array<T>(&self, ptr: *mut T, count: usize) {
    self.dealloc_at(ptr.cast(), size_of::<T>().saturating_mul(count), CallSite::here())
  }

  fn addr(&self) -> *const () {
    match self.inner {
      Some(a) => a as *const dyn RawAllocator as *const (),
      None => ptr::null(),
    }
  }
}

impl PartialEq for Allocator<'_> {
  fn eq(&self, other: &Self) -> bool {
    ptr::eq(self.addr(), other.addr())
  }
}

impl Eq for Allocator<'_> {}

impl fmt::Debug for Allocator<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_null() {
      f.write_str("Allocator(null)")
    } else {
      write!(f, "Allocator({:p})", self.addr())
    }
  }
}
