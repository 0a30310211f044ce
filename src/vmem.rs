//! OS virtual-memory primitives and the [`VirtualMemory`] allocator that sits
//! at the root of every allocator chain.
//!
//! On Unix the primitives map to `mmap` / `mprotect` / `madvise` / `munmap`.
//! Elsewhere a fallback over the global allocator collapses reserve and commit
//! into one page-aligned allocation and turns `decommit` into a no-op.
//!
//! ```text
//!   reserve ──► commit ──► decommit ──► commit ...
//!      │           │           │
//!      └───────────┴───────────┴──────► release
//! ```

use core::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::allocator::{Allocator, CallSite, RawAllocator};
use crate::error::{Error, Result};

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// OS page size in bytes, queried once.
pub fn page_size() -> usize {
  *PAGE_SIZE.get_or_init(os::page_size)
}

/// Reserves at least `size` bytes of address space without backing it.
/// The result is page-aligned; touching it before [`commit`] faults.
pub fn reserve(size: usize) -> Result<NonNull<u8>> {
  if size == 0 {
    return Err(Error::ZeroSize("vmem reservation"));
  }
  unsafe { os::reserve(size) }
}

/// Makes `[ptr, ptr + size)` readable and writable.
///
/// # Safety
///
/// The range must lie inside a region returned by [`reserve`].
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<()> {
  unsafe { os::commit(ptr, size) }
}

/// Returns the physical pages behind `[ptr, ptr + size)` while keeping the
/// address range reserved.
///
/// # Safety
///
/// The range must lie inside a region returned by [`reserve`], and nothing
/// may access it until it is committed again.
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<()> {
  unsafe { os::decommit(ptr, size) }
}

/// Returns a whole reservation to the OS.
///
/// # Safety
///
/// `ptr` and `size` must describe exactly a region returned by [`reserve`].
pub unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<()> {
  unsafe { os::release(ptr, size) }
}

/// Reserve + commit in one call.
pub fn alloc(size: usize) -> Result<NonNull<u8>> {
  if size == 0 {
    return Err(Error::ZeroSize("vmem allocation"));
  }
  unsafe { os::alloc(size) }
}

/// Releases memory obtained from [`alloc`].
///
/// # Safety
///
/// `ptr` and `size` must describe exactly a region returned by [`alloc`].
pub unsafe fn free(ptr: NonNull<u8>, size: usize) -> Result<()> {
  unsafe { os::release(ptr, size) }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
mod os {
  use super::*;

  pub(super) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
  }

  unsafe fn os_mmap(size: usize, prot: libc::c_int, op: &'static str) -> Result<NonNull<u8>> {
    let ptr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        size,
        prot,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      Err(Error::last_os(op))
    } else {
      NonNull::new(ptr.cast()).ok_or_else(|| Error::last_os(op))
    }
  }

  pub(super) unsafe fn reserve(size: usize) -> Result<NonNull<u8>> {
    unsafe { os_mmap(size, libc::PROT_NONE, "reserve") }
  }

  pub(super) unsafe fn alloc(size: usize) -> Result<NonNull<u8>> {
    unsafe { os_mmap(size, libc::PROT_READ | libc::PROT_WRITE, "alloc") }
  }

  pub(super) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<()> {
    let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
    if rc == 0 { Ok(()) } else { Err(Error::last_os("commit")) }
  }

  pub(super) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<()> {
    let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) };
    if rc != 0 {
      return Err(Error::last_os("decommit"));
    }

    // Best effort: the pages are already inaccessible either way.
    #[cfg(feature = "release-mem")]
    unsafe {
      libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED);
    }

    Ok(())
  }

  pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<()> {
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
    if rc == 0 { Ok(()) } else { Err(Error::last_os("release")) }
  }
}

#[cfg(not(unix))]
mod os {
  use super::*;
  use std::alloc::{Layout, alloc_zeroed, dealloc};

  pub(super) fn page_size() -> usize {
    4096
  }

  fn layout(size: usize) -> Result<Layout> {
    Layout::from_size_align(size, super::page_size()).map_err(|_| Error::OutOfMemory { requested: size })
  }

  pub(super) unsafe fn reserve(size: usize) -> Result<NonNull<u8>> {
    unsafe { alloc(size) }
  }

  pub(super) unsafe fn alloc(size: usize) -> Result<NonNull<u8>> {
    let layout = layout(size)?;
    NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(Error::OutOfMemory { requested: size })
  }

  pub(super) unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<()> {
    Ok(())
  }

  pub(super) unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<()> {
    Ok(())
  }

  pub(super) unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<()> {
    unsafe { dealloc(ptr.as_ptr(), layout(size)?) };
    Ok(())
  }
}

// =============================================================================
// Allocator view
// =============================================================================

/// Root allocator: every `alloc` is a fresh committed mapping.
///
/// `dealloc` needs the exact size that was allocated, which is what arena,
/// heap, pool, ring and hash map all pass back.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualMemory;

impl VirtualMemory {
  pub const fn allocator() -> Allocator<'static> {
    Allocator::new(&VirtualMemory)
  }
}

impl RawAllocator for VirtualMemory {
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }
    match alloc(size) {
      Ok(p) => p.as_ptr(),
      Err(err) => {
        log::warn!("vmem alloc of {size} bytes failed at {site}: {err}");
        ptr::null_mut()
      }
    }
  }

  fn dealloc(&self, ptr: *mut u8, size: usize, site: CallSite) {
    let Some(p) = NonNull::new(ptr) else {
      return;
    };
    if let Err(err) = unsafe { free(p, size) } {
      log::warn!("vmem free of {size} bytes at {ptr:p} failed at {site}: {err}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_size_is_power_of_two() {
    let size = page_size();
    assert!(size.is_power_of_two());
    assert_eq!(size, page_size());
  }

  #[test]
  fn test_reserve_commit_decommit_release() {
    let size = page_size() * 4;
    let base = reserve(size).unwrap();
    assert_eq!(base.as_ptr() as usize % page_size(), 0);

    unsafe {
      commit(base, size).unwrap();
      base.as_ptr().write_bytes(0xAB, size);
      assert_eq!(*base.as_ptr().add(size - 1), 0xAB);

      let second = NonNull::new_unchecked(base.as_ptr().add(page_size()));
      decommit(second, page_size()).unwrap();
      commit(second, page_size()).unwrap();
      *second.as_ptr() = 7;
      assert_eq!(*second.as_ptr(), 7);

      release(base, size).unwrap();
    }
  }

  #[test]
  fn test_alloc_is_zeroed_and_writable() {
    let size = 10_000;
    let p = alloc(size).unwrap();
    unsafe {
      let bytes = core::slice::from_raw_parts_mut(p.as_ptr(), size);
      assert!(bytes.iter().all(|&b| b == 0));
      bytes.fill(1);
      free(p, size).unwrap();
    }
  }

  #[test]
  fn test_zero_size_is_rejected() {
    assert!(matches!(reserve(0), Err(Error::ZeroSize(_))));
    assert!(matches!(alloc(0), Err(Error::ZeroSize(_))));
  }

  #[test]
  fn test_allocator_view() {
    let vm = VirtualMemory::allocator();
    let p = vm.alloc(5000);
    assert!(!p.is_null());
    assert_eq!(p as usize % page_size(), 0);
    unsafe { p.write_bytes(3, 5000) };
    vm.dealloc(p, 5000);

    assert!(vm.alloc(0).is_null());
    vm.dealloc(ptr::null_mut(), 0);
  }
}
