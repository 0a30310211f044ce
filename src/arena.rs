//! Bump-pointer allocator over a chain of blocks.
//!
//! ```text
//!   head                                   tail
//!    │                                      │
//!    ▼                                      ▼
//!   ┌────────┬──────┬───┬──────┬────────┐  ┌────────┬──────┬────────────────┐
//!   │ header │  A1  │pad│  A2  │  free  │─►│ header │  A3  │      free      │
//!   └────────┴──────┴───┴──────┴────────┘  └────────┴──────┴────────────────┘
//!                              ▲                           ▲
//!                           used                         used
//! ```
//!
//! Allocations are never released one by one: [`Arena::clear`] rewinds every
//! cursor, dropping the arena returns the blocks it obtained from its parent.

use core::mem::{align_of, size_of};
use core::ptr;

use crate::allocator::{Allocator, CallSite, MIN_ALIGN, RawAllocator};
use crate::error::Result;
use crate::sync::{Guarded, Mutex, MutexSlot};
use crate::util::{check_block, checked_align_up};

/// Bytes taken from the front of every block by its header.
pub const BLOCK_HEADER_SIZE: usize = size_of::<ArenaBlock>();

// =============================================================================
// Block
// =============================================================================

#[repr(C)]
pub(crate) struct ArenaBlock {
  pub(crate) next: *mut ArenaBlock,
  /// Total size including this header.
  pub(crate) size: usize,
  /// Bytes consumed, counted from the start of the header.
  pub(crate) used: usize,
  /// Obtained from the parent, which gets it back on destroy.
  pub(crate) owned: bool,
}

impl ArenaBlock {
  unsafe fn init(base: *mut u8, size: usize, owned: bool) -> *mut ArenaBlock {
    let blk = base.cast::<ArenaBlock>();
    unsafe {
      blk.write(ArenaBlock {
        next: ptr::null_mut(),
        size,
        used: BLOCK_HEADER_SIZE,
        owned,
      });
    }
    blk
  }

  /// Bumps `size` bytes aligned to `align` out of this block, or returns null.
  unsafe fn bump(blk: *mut ArenaBlock, size: usize, align: usize) -> *mut u8 {
    let b = unsafe { &mut *blk };
    let cursor = blk as usize + b.used;
    let Some(aligned) = checked_align_up(cursor, align) else {
      return ptr::null_mut();
    };
    let pad = aligned - cursor;
    let avail = b.size - b.used;
    if pad > avail || size > avail - pad {
      return ptr::null_mut();
    }
    b.used += pad + size;
    aligned as *mut u8
  }
}

/// Snapshot of one block, as reported by [`Arena::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub base: usize,
  pub size: usize,
  pub used: usize,
  pub owned: bool,
}

// =============================================================================
// Arena
// =============================================================================

pub(crate) struct ArenaState {
  pub(crate) head: *mut ArenaBlock,
  pub(crate) tail: *mut ArenaBlock,
}

// SAFETY: the chain is reachable only through this state, and the memory it
// points at comes from a `Sync` parent or from the caller via `add_block`.
unsafe impl Send for ArenaState {}

impl ArenaState {
  fn push(&mut self, blk: *mut ArenaBlock) {
    if self.tail.is_null() {
      self.head = blk;
    } else {
      unsafe { (*self.tail).next = blk };
    }
    self.tail = blk;
  }

  /// First fit over the chain.
  unsafe fn bump_any(&mut self, size: usize, align: usize) -> *mut u8 {
    let mut blk = self.head;
    while !blk.is_null() {
      let p = unsafe { ArenaBlock::bump(blk, size, align) };
      if !p.is_null() {
        return p;
      }
      blk = unsafe { (*blk).next };
    }
    ptr::null_mut()
  }
}

/// Linear allocator. See the [module docs](self).
///
/// Without a mutex the arena serves one caller at a time: a call that overlaps
/// another one from a different thread panics.
pub struct Arena<'a> {
  parent: Allocator<'a>,
  default_block_size: usize,
  pub(crate) state: Guarded<'a, ArenaState>,
}

impl<'a> Arena<'a> {
  /// Creates an empty arena. Nothing is allocated until the first request.
  ///
  /// With a null `parent` the arena only serves blocks added through
  /// [`Arena::add_block`].
  pub const fn new(parent: Allocator<'a>, mutex: Option<&'a Mutex>, default_block_size: usize) -> Self {
    Self {
      parent,
      default_block_size,
      state: Guarded::new(
        MutexSlot::from_option(mutex),
        ArenaState {
          head: ptr::null_mut(),
          tail: ptr::null_mut(),
        },
      ),
    }
  }

  /// Like [`Arena::new`], with a mutex owned by the arena.
  pub fn new_mutexed(parent: Allocator<'a>, default_block_size: usize) -> Self {
    Self {
      parent,
      default_block_size,
      state: Guarded::new(
        MutexSlot::owned(),
        ArenaState {
          head: ptr::null_mut(),
          tail: ptr::null_mut(),
        },
      ),
    }
  }

  /// Releases owned blocks and the owned mutex. Same as dropping the arena.
  pub fn destroy(self) {
    drop(self);
  }

  /// Allocator view. `dealloc` through it is a no-op.
  pub fn allocator(&self) -> Allocator<'_> {
    Allocator::new(self)
  }

  pub fn parent(&self) -> Allocator<'a> {
    self.parent
  }

  pub fn default_block_size(&self) -> usize {
    self.default_block_size
  }

  pub fn is_mutexed(&self) -> bool {
    self.state.mutex().get().is_some()
  }

  // ---------------------------------------------------------------------------
  // Block management
  // ---------------------------------------------------------------------------

  /// Appends a caller-owned region to the chain. The arena never frees it.
  ///
  /// # Safety
  ///
  /// `ptr` must be valid for reads and writes of `size` bytes until it is
  /// removed with [`Arena::remove_block`] or the arena is dropped.
  pub unsafe fn add_block(&self, ptr: *mut u8, size: usize) -> Result<()> {
    check_block(ptr, size, align_of::<ArenaBlock>(), BLOCK_HEADER_SIZE)?;
    self.state.with(|st| {
      let blk = unsafe { ArenaBlock::init(ptr, size, false) };
      st.push(blk);
    });
    Ok(())
  }

  /// Detaches the block whose base is `ptr`. Every allocation made from it
  /// becomes invalid. A block the arena obtained itself is handed back to the
  /// parent. Returns `false` if no block starts at `ptr`.
  #[track_caller]
  pub fn remove_block(&self, ptr: *mut u8) -> bool {
    let site = CallSite::here();
    self.state.with(|st| {
      let mut prev: *mut ArenaBlock = ptr::null_mut();
      let mut blk = st.head;
      while !blk.is_null() {
        let next = unsafe { (*blk).next };
        if blk.cast::<u8>() == ptr {
          if prev.is_null() {
            st.head = next;
          } else {
            unsafe { (*prev).next = next };
          }
          if st.tail == blk {
            st.tail = prev;
          }
          unsafe { self.release_block(blk, site) };
          return true;
        }
        prev = blk;
        blk = next;
      }
      false
    })
  }

  pub(crate) unsafe fn release_block(&self, blk: *mut ArenaBlock, site: CallSite) {
    let (owned, size) = unsafe { ((*blk).owned, (*blk).size) };
    if owned {
      log::trace!("arena: releasing {size}-byte block {blk:p} at {site}");
      self.parent.dealloc_at(blk.cast(), size, site);
    }
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// `size` bytes aligned to `align` (a power of two), or null.
  #[track_caller]
  pub fn alloc(&self, size: usize, align: usize) -> *mut u8 {
    self.alloc_at(size, align, CallSite::here())
  }

  pub fn alloc_at(&self, size: usize, align: usize, site: CallSite) -> *mut u8 {
    if !align.is_power_of_two() {
      log::warn!("arena: alignment {align} is not a power of two at {site}");
      return ptr::null_mut();
    }
    self.state.with(|st| unsafe { self.alloc_locked(st, size.max(1), align, site) })
  }

  unsafe fn alloc_locked(&self, st: &mut ArenaState, size: usize, align: usize, site: CallSite) -> *mut u8 {
    let p = unsafe { st.bump_any(size, align) };
    if !p.is_null() || self.parent.is_null() {
      return p;
    }

    let Some(needed) = BLOCK_HEADER_SIZE
      .checked_add(align)
      .and_then(|v| v.checked_add(size))
    else {
      return ptr::null_mut();
    };
    let block_size = self.default_block_size.max(needed);

    let base = self.parent.alloc_at(block_size, site);
    if base.is_null() {
      log::warn!("arena: parent could not supply a {block_size}-byte block at {site}");
      return ptr::null_mut();
    }
    log::trace!("arena: grew by {block_size}-byte block {base:p} at {site}");

    let blk = unsafe { ArenaBlock::init(base, block_size, true) };
    st.push(blk);
    unsafe { ArenaBlock::bump(blk, size, align) }
  }

  /// Resizes an allocation. When `ptr` is the last allocation of its block it
  /// grows or shrinks in place; otherwise the data moves to a new region and
  /// the old one is left behind until [`Arena::clear`].
  ///
  /// # Safety
  ///
  /// `ptr` must be null or an allocation of `old_size` bytes from this arena
  /// that is still live.
  #[track_caller]
  pub unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize) -> *mut u8 {
    unsafe { self.realloc_at(ptr, old_size, new_size, align, CallSite::here()) }
  }

  /// # Safety
  ///
  /// See [`Arena::realloc`].
  pub unsafe fn realloc_at(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize, site: CallSite) -> *mut u8 {
    if ptr.is_null() {
      return self.alloc_at(new_size, align, site);
    }
    if !align.is_power_of_two() {
      log::warn!("arena: alignment {align} is not a power of two at {site}");
      return ptr::null_mut();
    }

    self.state.with(|st| {
      let addr = ptr as usize;
      let mut blk = st.head;
      while !blk.is_null() {
        let b = unsafe { &mut *blk };
        let data_start = blk as usize + BLOCK_HEADER_SIZE;
        if addr >= data_start && addr.wrapping_add(old_size) == blk as usize + b.used {
          if new_size <= old_size {
            b.used -= old_size - new_size;
            return ptr;
          }
          if new_size - old_size <= b.size - b.used {
            b.used += new_size - old_size;
            return ptr;
          }
          break;
        }
        blk = b.next;
      }

      let new_ptr = unsafe { self.alloc_locked(st, new_size.max(1), align, site) };
      if !new_ptr.is_null() {
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
      }
      new_ptr
    })
  }

  #[track_caller]
  pub fn alloc_type<T>(&self) -> *mut T {
    self.alloc_at(size_of::<T>(), align_of::<T>(), CallSite::here()).cast()
  }

  #[track_caller]
  pub fn alloc_array<T>(&self, count: usize) -> *mut T {
    match size_of::<T>().checked_mul(count) {
      Some(total) => self.alloc_at(total, align_of::<T>(), CallSite::here()).cast(),
      None => ptr::null_mut(),
    }
  }

  /// # Safety
  ///
  /// See [`Arena::realloc`].
  #[track_caller]
  pub unsafe fn realloc_array<T>(&self, ptr: *mut T, old_count: usize, new_count: usize) -> *mut T {
    let (Some(old), Some(new)) = (
      size_of::<T>().checked_mul(old_count),
      size_of::<T>().checked_mul(new_count),
    ) else {
      return ptr::null_mut();
    };
    unsafe { self.realloc_at(ptr.cast(), old, new, align_of::<T>(), CallSite::here()) }.cast()
  }

  // ---------------------------------------------------------------------------
  // Lifecycle
  // ---------------------------------------------------------------------------

  /// Rewinds every block to just past its header. Blocks are kept.
  pub fn clear(&self) {
    self.state.with(|st| {
      let mut blk = st.head;
      while !blk.is_null() {
        unsafe {
          (*blk).used = BLOCK_HEADER_SIZE;
          blk = (*blk).next;
        }
      }
    });
  }

  pub fn blocks(&self) -> Vec<BlockInfo> {
    self.state.with(|st| {
      let mut out = Vec::new();
      let mut blk = st.head;
      while !blk.is_null() {
        let b = unsafe { &*blk };
        out.push(BlockInfo {
          base: blk as usize,
          size: b.size,
          used: b.used,
          owned: b.owned,
        });
        blk = b.next;
      }
      out
    })
  }

  /// Sum of `used` over all blocks, headers included.
  pub fn used_bytes(&self) -> usize {
    self.blocks().iter().map(|b| b.used).sum()
  }
}

impl Drop for Arena<'_> {
  fn drop(&mut self) {
    let site = CallSite::here();
    let parent = self.parent;
    let st = self.state.get_mut();

    let (mut released, mut detached) = (0usize, 0usize);
    let mut blk = st.head;
    while !blk.is_null() {
      let (next, owned, size) = unsafe { ((*blk).next, (*blk).owned, (*blk).size) };
      if owned {
        parent.dealloc_at(blk.cast(), size, site);
        released += 1;
      } else {
        detached += 1;
      }
      blk = next;
    }
    st.head = ptr::null_mut();
    st.tail = ptr::null_mut();

    if released + detached > 0 {
      log::debug!("arena: destroyed, {released} blocks released, {detached} detached");
    }
  }
}

impl RawAllocator for Arena<'_> {
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8 {
    self.alloc_at(size, MIN_ALIGN, site)
  }

  fn dealloc(&self, _ptr: *mut u8, _size: usize, _site: CallSite) {}

  fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize, site: CallSite) -> *mut u8 {
    // SAFETY: callers of the allocator view pass back pointers it handed out.
    unsafe { self.realloc_at(ptr, old_size, new_size, MIN_ALIGN, site) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use crate::vmem::VirtualMemory;

  #[test]
  fn test_new_allocates_nothing() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    assert!(arena.blocks().is_empty());
    assert_eq!(arena.used_bytes(), 0);
  }

  #[test]
  fn test_alloc_alignment_and_growth() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    for align in [1, 2, 8, 16, 64, 256] {
      let p = arena.alloc(13, align);
      assert!(!p.is_null());
      assert_eq!(p as usize % align, 0);
    }
    assert_eq!(arena.blocks().len(), 1);

    let big = arena.alloc(10_000, 8);
    assert!(!big.is_null());
    let blocks = arena.blocks();
    assert_eq!(blocks.len(), 2);
    assert!(blocks[1].size >= BLOCK_HEADER_SIZE + 8 + 10_000);
    assert!(blocks.iter().all(|b| b.owned && b.used <= b.size));
  }

  #[test]
  fn test_bad_alignment_fails() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    assert!(arena.alloc(8, 3).is_null());
    assert!(arena.alloc(8, 0).is_null());
    assert!(arena.blocks().is_empty());
  }

  #[test]
  fn test_no_parent_no_blocks() {
    let arena = Arena::new(Allocator::null(), None, 4096);
    assert!(arena.alloc(1, 1).is_null());
  }

  #[test]
  fn test_zero_size_allocations_are_distinct() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    let a = arena.alloc(0, 1);
    let b = arena.alloc(0, 1);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);
  }

  #[test]
  fn test_realloc_in_place_at_cursor() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    let p = arena.alloc(100, 8);
    unsafe { p.write_bytes(0x5A, 100) };
    let used = arena.used_bytes();

    let q = unsafe { arena.realloc(p, 100, 300, 8) };
    assert_eq!(p, q);
    assert_eq!(arena.used_bytes(), used + 200);

    let r = unsafe { arena.realloc(q, 300, 50, 8) };
    assert_eq!(p, r);
    assert_eq!(arena.used_bytes(), used - 50);
    assert_eq!(unsafe { *r.add(49) }, 0x5A);
  }

  #[test]
  fn test_realloc_moves_when_not_last() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    let p = arena.alloc(16, 8);
    unsafe { ptr::copy_nonoverlapping(b"0123456789abcdef".as_ptr(), p, 16) };
    let _blocker = arena.alloc(8, 8);

    let q = unsafe { arena.realloc(p, 16, 64, 8) };
    assert_ne!(p, q);
    assert_eq!(unsafe { core::slice::from_raw_parts(q, 16) }, b"0123456789abcdef");
  }

  #[test]
  fn test_add_and_remove_caller_block() {
    let mut storage = vec![0u64; 128];
    let base = storage.as_mut_ptr().cast::<u8>();
    let arena = Arena::new(Allocator::null(), None, 0);

    unsafe { arena.add_block(base, 1024).unwrap() };
    let p = arena.alloc(64, 8);
    assert!(p as usize >= base as usize + BLOCK_HEADER_SIZE);
    assert!((p as usize) < base as usize + 1024);
    assert!(!arena.blocks()[0].owned);

    assert!(arena.remove_block(base));
    assert!(!arena.remove_block(base));
    assert!(arena.alloc(64, 8).is_null());
  }

  #[test]
  fn test_add_block_rejects_bad_regions() {
    let mut storage = vec![0u64; 16];
    let base = storage.as_mut_ptr().cast::<u8>();
    let arena = Arena::new(Allocator::null(), None, 0);

    assert!(matches!(
      unsafe { arena.add_block(base, BLOCK_HEADER_SIZE) },
      Err(Error::BlockTooSmall { .. })
    ));
    assert!(matches!(
      unsafe { arena.add_block(base.add(1), 64) },
      Err(Error::MisalignedBlock { .. })
    ));
    assert!(matches!(
      unsafe { arena.add_block(ptr::null_mut(), 64) },
      Err(Error::NullPointer("block"))
    ));
    assert!(arena.blocks().is_empty());
  }

  #[test]
  fn test_clear_keeps_blocks() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    arena.alloc(3000, 8);
    arena.alloc(3000, 8);
    assert_eq!(arena.blocks().len(), 2);

    arena.clear();
    let blocks = arena.blocks();
    assert_eq!(blocks.len(), 2);
    assert!(blocks.iter().all(|b| b.used == BLOCK_HEADER_SIZE));
  }

  #[test]
  fn test_allocator_view_stacks() {
    let arena = Arena::new_mutexed(VirtualMemory::allocator(), 4096);
    assert!(arena.is_mutexed());
    let view = arena.allocator();
    assert_eq!(view, arena.allocator());

    let p = view.alloc(24);
    assert_eq!(p as usize % MIN_ALIGN, 0);
    view.dealloc(p, 24);
    let z = view.calloc(8, 8);
    assert!(unsafe { core::slice::from_raw_parts(z, 64) }.iter().all(|&b| b == 0));
  }

  #[test]
  fn test_typed_helpers() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    #[repr(align(32))]
    struct Aligned(#[allow(dead_code)] [u8; 40]);

    let one = arena.alloc_type::<Aligned>();
    assert_eq!(one as usize % 32, 0);

    let arr = arena.alloc_array::<u16>(8);
    unsafe { arr.add(7).write(77) };
    let grown = unsafe { arena.realloc_array(arr, 8, 64) };
    assert_eq!(arr, grown);
    assert_eq!(unsafe { grown.add(7).read() }, 77);
  }
}
