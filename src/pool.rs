//! Fixed-size slot allocator.
//!
//! Blocks are cut into slots of one stride. Free slots form an intrusive LIFO
//! list: the first pointer-sized bytes of a free slot hold the next free slot.
//!
//! ```text
//!   ┌───────────┬─────┬────────┬────────┬────────┬─────┬────────┬──────┐
//!   │ PoolBlock │ pad │ slot 0 │ slot 1 │ slot 2 │ ... │ slot n │ tail │
//!   └───────────┴─────┴────────┴────────┴────────┴─────┴────────┴──────┘
//!                      ◄stride►
//!   free ──► slot 0 ──► slot 1 ──► ... ──► slot n ──► null
//! ```

use core::mem::{align_of, size_of};
use core::ptr;

use crate::allocator::{Allocator, CallSite, MIN_ALIGN, RawAllocator};
use crate::error::{Error, Result};
use crate::sync::{Guarded, Mutex, MutexSlot};
use crate::util::{align_up, check_block, checked_align_up};

pub const BLOCK_HEADER_SIZE: usize = size_of::<PoolBlock>();

#[repr(C)]
struct PoolBlock {
  next: *mut PoolBlock,
  size: usize,
  owned: bool,
}

/// Snapshot of one block, as reported by [`Pool::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub base: usize,
  pub size: usize,
  pub owned: bool,
  pub slots: usize,
}

#[inline]
unsafe fn read_next(slot: *mut u8) -> *mut u8 {
  unsafe { slot.cast::<*mut u8>().read_unaligned() }
}

#[inline]
unsafe fn write_next(slot: *mut u8, next: *mut u8) {
  unsafe { slot.cast::<*mut u8>().write_unaligned(next) };
}

struct PoolState {
  head: *mut PoolBlock,
  tail: *mut PoolBlock,
  free: *mut u8,
}

// SAFETY: blocks and free slots are reachable only through this state.
unsafe impl Send for PoolState {}

/// Slot geometry, fixed at construction.
#[derive(Debug, Clone, Copy)]
struct SlotLayout {
  object_size: usize,
  object_align: usize,
  stride: usize,
  /// Alignment of the first slot: fits both the object and the link.
  slot_align: usize,
}

impl SlotLayout {
  /// First slot address and slot count of `blk`.
  fn slots(&self, blk: *mut PoolBlock) -> (usize, usize) {
    let start = blk as usize + BLOCK_HEADER_SIZE;
    let first = align_up(start, self.slot_align);
    let size = unsafe { (*blk).size };
    let used = first - blk as usize;
    let count = if size > used { (size - used) / self.stride } else { 0 };
    (first, count)
  }
}

impl PoolState {
  /// Pushes every slot of `blk`, highest address first, so pops walk forward.
  unsafe fn carve(&mut self, layout: &SlotLayout, blk: *mut PoolBlock) {
    let (first, count) = layout.slots(blk);
    for i in (0..count).rev() {
      let slot = (first + i * layout.stride) as *mut u8;
      unsafe { write_next(slot, self.free) };
      self.free = slot;
    }
  }

  unsafe fn chain(&mut self, base: *mut u8, size: usize, owned: bool) -> *mut PoolBlock {
    let blk = base.cast::<PoolBlock>();
    unsafe {
      blk.write(PoolBlock {
        next: ptr::null_mut(),
        size,
        owned,
      });
    }
    if self.tail.is_null() {
      self.head = blk;
    } else {
      unsafe { (*self.tail).next = blk };
    }
    self.tail = blk;
    blk
  }

  fn pop(&mut self) -> *mut u8 {
    let slot = self.free;
    if !slot.is_null() {
      self.free = unsafe { read_next(slot) };
    }
    slot
  }

  /// Drops every free slot inside `[start, end)` from the list.
  unsafe fn purge(&mut self, start: usize, end: usize) {
    let mut prev: *mut u8 = ptr::null_mut();
    let mut slot = self.free;
    while !slot.is_null() {
      let next = unsafe { read_next(slot) };
      if (start..end).contains(&(slot as usize)) {
        if prev.is_null() {
          self.free = next;
        } else {
          unsafe { write_next(prev, next) };
        }
      } else {
        prev = slot;
      }
      slot = next;
    }
  }

  #[cfg(feature = "debug-tripwire")]
  fn owns_slot(&self, layout: &SlotLayout, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    let mut blk = self.head;
    while !blk.is_null() {
      let (first, count) = layout.slots(blk);
      if addr >= first && addr < first + count * layout.stride {
        return (addr - first) % layout.stride == 0;
      }
      blk = unsafe { (*blk).next };
    }
    false
  }
}

/// Fixed-size allocator. See the [module docs](self).
///
/// Without a mutex the pool serves one caller at a time: a call that overlaps
/// another one from a different thread panics.
pub struct Pool<'a> {
  parent: Allocator<'a>,
  default_block_size: usize,
  layout: SlotLayout,
  state: Guarded<'a, PoolState>,
}

impl<'a> Pool<'a> {
  /// Creates an empty pool of `object_size`-byte slots aligned to
  /// `object_align`.
  pub fn new(
    parent: Allocator<'a>,
    mutex: Option<&'a Mutex>,
    default_block_size: usize,
    object_size: usize,
    object_align: usize,
  ) -> Result<Self> {
    Self::with_slot(parent, MutexSlot::from_option(mutex), default_block_size, object_size, object_align)
  }

  pub fn new_mutexed(
    parent: Allocator<'a>,
    default_block_size: usize,
    object_size: usize,
    object_align: usize,
  ) -> Result<Self> {
    Self::with_slot(parent, MutexSlot::owned(), default_block_size, object_size, object_align)
  }

  /// Pool sized and aligned for `T`.
  pub fn for_type<T>(parent: Allocator<'a>, mutex: Option<&'a Mutex>, default_block_size: usize) -> Result<Self> {
    Self::new(parent, mutex, default_block_size, size_of::<T>(), align_of::<T>())
  }

  fn with_slot(
    parent: Allocator<'a>,
    mutex: MutexSlot<'a>,
    default_block_size: usize,
    object_size: usize,
    object_align: usize,
  ) -> Result<Self> {
    if object_size == 0 {
      return Err(Error::ZeroSize("pool object size"));
    }
    if !object_align.is_power_of_two() {
      return Err(Error::InvalidAlignment(object_align));
    }
    let stride = checked_align_up(object_size.max(size_of::<*mut u8>()), object_align)
      .ok_or(Error::OutOfMemory { requested: object_size })?;

    Ok(Self {
      parent,
      default_block_size,
      layout: SlotLayout {
        object_size,
        object_align,
        stride,
        slot_align: object_align.max(align_of::<*mut u8>()),
      },
      state: Guarded::new(
        mutex,
        PoolState {
          head: ptr::null_mut(),
          tail: ptr::null_mut(),
          free: ptr::null_mut(),
        },
      ),
    })
  }

  pub fn destroy(self) {
    drop(self);
  }

  /// Allocator view. `alloc` hands out one slot for any size up to
  /// [`Pool::object_size`]; `realloc` only succeeds when the size stays equal
  /// to it.
  ///
  /// Unlike a bare slot request, the view checks its input: a size larger than
  /// a slot returns null instead of a slot too small for it, and so does any
  /// request when the stride is not a multiple of [`MIN_ALIGN`], since slots
  /// past the first would then break the view's alignment guarantee.
  pub fn allocator(&self) -> Allocator<'_> {
    Allocator::new(self)
  }

  pub fn parent(&self) -> Allocator<'a> {
    self.parent
  }

  pub fn object_size(&self) -> usize {
    self.layout.object_size
  }

  pub fn object_align(&self) -> usize {
    self.layout.object_align
  }

  /// Distance between consecutive slots.
  pub fn stride(&self) -> usize {
    self.layout.stride
  }

  pub fn is_mutexed(&self) -> bool {
    self.state.mutex().get().is_some()
  }

  // ---------------------------------------------------------------------------
  // Block management
  // ---------------------------------------------------------------------------

  /// Adds a caller-owned region and carves it into free slots.
  ///
  /// # Safety
  ///
  /// `ptr` must be valid for reads and writes of `size` bytes until it is
  /// removed with [`Pool::remove_block`] or the pool is dropped.
  pub unsafe fn add_block(&self, ptr: *mut u8, size: usize) -> Result<()> {
    check_block(ptr, size, align_of::<PoolBlock>(), BLOCK_HEADER_SIZE)?;
    self.state.with(|st| unsafe {
      let blk = st.chain(ptr, size, false);
      st.carve(&self.layout, blk);
    });
    Ok(())
  }

  /// Detaches the block starting at `ptr` and drops its free slots from the
  /// free list. A block the pool obtained itself goes back to the parent.
  #[track_caller]
  pub fn remove_block(&self, ptr: *mut u8) -> bool {
    let site = CallSite::here();
    self.state.with(|st| {
      let mut prev: *mut PoolBlock = ptr::null_mut();
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

          let (owned, size) = unsafe { ((*blk).owned, (*blk).size) };
          unsafe { st.purge(blk as usize, blk as usize + size) };
          if owned {
            log::trace!("pool: releasing {size}-byte block {blk:p} at {site}");
            self.parent.dealloc_at(blk.cast(), size, site);
          }
          return true;
        }
        prev = blk;
        blk = next;
      }
      false
    })
  }

  // ---------------------------------------------------------------------------
  // Allocation
  // ---------------------------------------------------------------------------

  /// One slot, or null.
  #[track_caller]
  pub fn alloc(&self) -> *mut u8 {
    self.alloc_at(CallSite::here())
  }

  pub fn alloc_at(&self, site: CallSite) -> *mut u8 {
    self.state.with(|st| {
      let slot = st.pop();
      if !slot.is_null() || self.parent.is_null() {
        return slot;
      }

      let layout = &self.layout;
      let Some(needed) = BLOCK_HEADER_SIZE
        .checked_add(layout.slot_align)
        .and_then(|v| v.checked_add(layout.stride))
      else {
        return ptr::null_mut();
      };
      let block_size = self.default_block_size.max(needed);

      let base = self.parent.alloc_at(block_size, site);
      if base.is_null() {
        log::warn!("pool: parent could not supply a {block_size}-byte block at {site}");
        return ptr::null_mut();
      }
      log::trace!("pool: grew by {block_size}-byte block {base:p} at {site}");

      unsafe {
        let blk = st.chain(base, block_size, true);
        st.carve(layout, blk);
      }
      st.pop()
    })
  }

  /// Storage for one `T`, or null when `T` does not fit a slot.
  #[track_caller]
  pub fn alloc_type<T>(&self) -> *mut T {
    if size_of::<T>() > self.layout.object_size || align_of::<T>() > self.layout.object_align {
      return ptr::null_mut();
    }
    self.alloc_at(CallSite::here()).cast()
  }

  /// Pushes `ptr` back onto the free list. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live slot from this pool.
  #[track_caller]
  pub unsafe fn dealloc(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    self.state.with(|st| {
      #[cfg(feature = "debug-tripwire")]
      if !st.owns_slot(&self.layout, ptr) {
        panic!("pool: {ptr:p} is not a slot of this pool");
      }

      unsafe { write_next(ptr, st.free) };
      st.free = ptr;
    });
  }

  // ---------------------------------------------------------------------------
  // Lifecycle and introspection
  // ---------------------------------------------------------------------------

  /// Marks every slot of every block free again.
  pub fn clear(&self) {
    self.state.with(|st| {
      st.free = ptr::null_mut();
      let mut blk = st.head;
      while !blk.is_null() {
        unsafe {
          st.carve(&self.layout, blk);
          blk = (*blk).next;
        }
      }
    });
  }

  /// Length of the free list.
  pub fn free_slots(&self) -> usize {
    self.state.with(|st| {
      let mut count = 0;
      let mut slot = st.free;
      while !slot.is_null() {
        count += 1;
        slot = unsafe { read_next(slot) };
      }
      count
    })
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
          owned: b.owned,
          slots: self.layout.slots(blk).1,
        });
        blk = b.next;
      }
      out
    })
  }
}

impl Drop for Pool<'_> {
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
    st.free = ptr::null_mut();

    if released + detached > 0 {
      log::debug!("pool: destroyed, {released} blocks released, {detached} detached");
    }
  }
}

impl RawAllocator for Pool<'_> {
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8 {
    if size > self.layout.object_size {
      log::warn!(
        "pool: {size}-byte request exceeds the {}-byte slot at {site}",
        self.layout.object_size
      );
      return ptr::null_mut();
    }
    if self.layout.stride % MIN_ALIGN != 0 {
      log::warn!(
        "pool: {}-byte stride cannot keep view allocations {MIN_ALIGN}-aligned at {site}",
        self.layout.stride
      );
      return ptr::null_mut();
    }
    self.alloc_at(site)
  }

  fn dealloc(&self, ptr: *mut u8, _size: usize, _site: CallSite) {
    // SAFETY: callers of the allocator view pass back pointers it handed out.
    unsafe { Pool::dealloc(self, ptr) }
  }

  fn realloc(&self, ptr: *mut u8, _old_size: usize, new_size: usize, _site: CallSite) -> *mut u8 {
    if new_size == self.layout.object_size { ptr } else { ptr::null_mut() }
  }
}
