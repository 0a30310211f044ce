//! Circular byte buffer.
//!
//! ```text
//!          read_pos          write_pos
//!             ▼                  ▼
//!   ┌───┬───┬───┬───┬───┬───┬───┬───┬───┐
//!   │   │   │ A │ B │ C │ D │ E │   │   │   count = 5
//!   └───┴───┴───┴───┴───┴───┴───┴───┴───┘
//! ```
//!
//! Writes and reads copy in at most two segments around the wrap point. No
//! framing is imposed on the bytes.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::allocator::{Allocator, CallSite};
use crate::error::{Error, Result};
use crate::sync::{Guarded, Mutex, MutexSlot};

#[derive(Debug, Default, Clone, Copy)]
struct Cursors {
  read: usize,
  write: usize,
  count: usize,
}

/// Byte ring over caller storage or storage taken from a parent allocator.
///
/// Without a mutex the ring serves one caller at a time: a call that overlaps
/// another one from a different thread panics.
pub struct Ring<'a> {
  buf: NonNull<u8>,
  capacity: usize,
  parent: Allocator<'a>,
  owns_buffer: bool,
  cursors: Guarded<'a, Cursors>,
  _storage: PhantomData<&'a mut [u8]>,
}

// SAFETY: the buffer is only read or written inside `cursors.with`, which
// admits one caller at a time, and the parent handle is `Sync`.
unsafe impl Send for Ring<'_> {}
unsafe impl Sync for Ring<'_> {}

impl<'a> Ring<'a> {
  // ---------------------------------------------------------------------------
  // Construction
  // ---------------------------------------------------------------------------

  /// Wraps `capacity` bytes at `ptr`. The ring never frees them. A null `ptr`
  /// fails with [`Error::NullPointer`].
  ///
  /// # Safety
  ///
  /// A non-null `ptr` must be valid for reads and writes of `capacity` bytes for `'a`,
  /// and nothing else may access that memory while the ring is alive.
  pub unsafe fn from_raw(ptr: *mut u8, capacity: usize, mutex: Option<&'a Mutex>) -> Result<Self> {
    unsafe { Self::wrap(ptr, capacity, MutexSlot::from_option(mutex)) }
  }

  /// # Safety
  ///
  /// See [`Ring::from_raw`].
  pub unsafe fn from_raw_mutexed(ptr: *mut u8, capacity: usize) -> Result<Self> {
    unsafe { Self::wrap(ptr, capacity, MutexSlot::owned()) }
  }

  pub fn from_slice(buf: &'a mut [u8], mutex: Option<&'a Mutex>) -> Result<Self> {
    unsafe { Self::wrap(buf.as_mut_ptr(), buf.len(), MutexSlot::from_option(mutex)) }
  }

  pub fn from_slice_mutexed(buf: &'a mut [u8]) -> Result<Self> {
    unsafe { Self::wrap(buf.as_mut_ptr(), buf.len(), MutexSlot::owned()) }
  }

  /// Takes `capacity` bytes from `parent`; they go back on drop.
  #[track_caller]
  pub fn with_allocator(parent: Allocator<'a>, capacity: usize, mutex: Option<&'a Mutex>) -> Result<Self> {
    Self::allocate(parent, capacity, MutexSlot::from_option(mutex), CallSite::here())
  }

  #[track_caller]
  pub fn with_allocator_mutexed(parent: Allocator<'a>, capacity: usize) -> Result<Self> {
    Self::allocate(parent, capacity, MutexSlot::owned(), CallSite::here())
  }

  unsafe fn wrap(ptr: *mut u8, capacity: usize, mutex: MutexSlot<'a>) -> Result<Self> {
    if capacity == 0 {
      return Err(Error::ZeroSize("ring capacity"));
    }
    let buf = NonNull::new(ptr).ok_or(Error::NullPointer("ring buffer"))?;
    Ok(Self {
      buf,
      capacity,
      parent: Allocator::null(),
      owns_buffer: false,
      cursors: Guarded::new(mutex, Cursors::default()),
      _storage: PhantomData,
    })
  }

  fn allocate(parent: Allocator<'a>, capacity: usize, mutex: MutexSlot<'a>, site: CallSite) -> Result<Self> {
    if capacity == 0 {
      return Err(Error::ZeroSize("ring capacity"));
    }
    let buf = NonNull::new(parent.alloc_at(capacity, site)).ok_or_else(|| {
      log::warn!("ring: parent could not supply {capacity} bytes at {site}");
      Error::OutOfMemory { requested: capacity }
    })?;
    Ok(Self {
      buf,
      capacity,
      parent,
      owns_buffer: true,
      cursors: Guarded::new(mutex, Cursors::default()),
      _storage: PhantomData,
    })
  }

  pub fn destroy(self) {
    drop(self);
  }

  // ---------------------------------------------------------------------------
  // Queries
  // ---------------------------------------------------------------------------

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes stored.
  pub fn size(&self) -> usize {
    self.cursors.with(|c| c.count)
  }

  /// Bytes that can still be written.
  pub fn space(&self) -> usize {
    self.cursors.with(|c| self.capacity - c.count)
  }

  pub fn is_empty(&self) -> bool {
    self.size() == 0
  }

  pub fn is_full(&self) -> bool {
    self.space() == 0
  }

  /// `(read_pos, write_pos)`.
  pub fn positions(&self) -> (usize, usize) {
    self.cursors.with(|c| (c.read, c.write))
  }

  pub fn owns_buffer(&self) -> bool {
    self.owns_buffer
  }

  pub fn is_mutexed(&self) -> bool {
    self.cursors.mutex().get().is_some()
  }

  // ---------------------------------------------------------------------------
  // I/O
  // ---------------------------------------------------------------------------

  /// Copies as much of `data` as fits. Returns the number of bytes written.
  pub fn write(&self, data: &[u8]) -> usize {
    self.cursors.with(|c| {
      let n = data.len().min(self.capacity - c.count);
      if n > 0 {
        unsafe { self.copy_in(c.write, data.as_ptr(), n) };
        c.write = (c.write + n) % self.capacity;
        c.count += n;
      }
      n
    })
  }

  /// Moves up to `out.len()` bytes out. Returns the number of bytes read.
  pub fn read(&self, out: &mut [u8]) -> usize {
    self.cursors.with(|c| {
      let n = out.len().min(c.count);
      if n > 0 {
        unsafe { self.copy_out(c.read, out.as_mut_ptr(), n) };
        c.read = (c.read + n) % self.capacity;
        c.count -= n;
      }
      n
    })
  }

  /// Like [`Ring::read`] without consuming anything.
  pub fn peek(&self, out: &mut [u8]) -> usize {
    self.cursors.with(|c| {
      let n = out.len().min(c.count);
      if n > 0 {
        unsafe { self.copy_out(c.read, out.as_mut_ptr(), n) };
      }
      n
    })
  }

  /// Discards up to `size` bytes. Returns the number discarded.
  pub fn skip(&self, size: usize) -> usize {
    self.cursors.with(|c| {
      let n = size.min(c.count);
      c.read = (c.read + n) % self.capacity;
      c.count -= n;
      n
    })
  }

  pub fn clear(&self) {
    self.cursors.with(|c| *c = Cursors::default());
  }

  unsafe fn copy_in(&self, offset: usize, src: *const u8, len: usize) {
    let base = self.buf.as_ptr();
    let to_end = self.capacity - offset;
    unsafe {
      if len <= to_end {
        ptr::copy_nonoverlapping(src, base.add(offset), len);
      } else {
        ptr::copy_nonoverlapping(src, base.add(offset), to_end);
        ptr::copy_nonoverlapping(src.add(to_end), base, len - to_end);
      }
    }
  }

  unsafe fn copy_out(&self, offset: usize, dst: *mut u8, len: usize) {
    let base = self.buf.as_ptr();
    let to_end = self.capacity - offset;
    unsafe {
      if len <= to_end {
        ptr::copy_nonoverlapping(base.add(offset), dst, len);
      } else {
        ptr::copy_nonoverlapping(base.add(offset), dst, to_end);
        ptr::copy_nonoverlapping(base, dst.add(to_end), len - to_end);
      }
    }
  }
}

impl Drop for Ring<'_> {
  fn drop(&mut self) {
    if self.owns_buffer {
      self
        .parent
        .dealloc_at(self.buf.as_ptr(), self.capacity, CallSite::here());
      self.owns_buffer = false;
    }
  }
}
