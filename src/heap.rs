//! General-purpose free-list allocator with split and forward coalescing.
//!
//! Each block starts with a [`HeapBlock`] header followed by a chain of chunks.
//! Every chunk carries a header; allocated chunks also store a back-reference
//! to their header in the last pointer-sized bytes before the user pointer,
//! which is how `dealloc` finds the chunk for any alignment.
//!
//! ```text
//!   block                  chunk                         chunk (split remainder)
//!   ┌────────────┬──────────────┬─────────┬──────┬──────┬──────────────┬───────────┐
//!   │ HeapBlock  │    Chunk     │ padding │ back │ user │    Chunk     │   free    │
//!   │ next, size │ next_in_block│         │ ref  │ data │ is_free = 1  │   body    │
//!   └────────────┴──────────────┴─────────┴──────┴──────┴──────────────┴───────────┘
//!                 ◄──────────── align_pad ──────►▲
//!                                                user pointer
//! ```
//!
//! Coalescing only looks forward: a freed chunk swallows the free chunks that
//! follow it in its block.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::{align_of, size_of};
use core::ptr;

use crate::allocator::{Allocator, CallSite, MIN_ALIGN, RawAllocator};
use crate::error::Result;
use crate::sync::{Guarded, Mutex, MutexSlot};
use crate::util::{align_up, check_block, checked_align_up, is_aligned};

pub const BLOCK_HEADER_SIZE: usize = size_of::<HeapBlock>();
pub const CHUNK_HEADER_SIZE: usize = size_of::<Chunk>();

const BACK_REF_SIZE: usize = size_of::<*mut Chunk>();
const CHUNK_ALIGN: usize = align_of::<Chunk>();
/// Smallest remainder worth splitting off into its own chunk.
const MIN_SPLIT: usize = CHUNK_HEADER_SIZE + BACK_REF_SIZE;

// =============================================================================
// Chunks and blocks
// =============================================================================

#[repr(C)]
struct Chunk {
  next_in_block: *mut Chunk,
  /// Meaningful only while `is_free`.
  next_free: *mut Chunk,
  /// Usable bytes after `align_pad`.
  size: usize,
  align_pad: usize,
  is_free: bool,
}

impl Chunk {
  #[inline]
  fn body(c: *mut Chunk) -> usize {
    c as usize + CHUNK_HEADER_SIZE
  }
}

#[inline]
unsafe fn write_back_ref(user: *mut u8, chunk: *mut Chunk) {
  unsafe { user.sub(BACK_REF_SIZE).cast::<*mut Chunk>().write_unaligned(chunk) };
}

#[inline]
unsafe fn read_back_ref(user: *const u8) -> *mut Chunk {
  unsafe { user.sub(BACK_REF_SIZE).cast::<*mut Chunk>().read_unaligned() }
}

#[repr(C)]
struct HeapBlock {
  next: *mut HeapBlock,
  size: usize,
  owned: bool,
}

impl HeapBlock {
  #[inline]
  fn first_chunk(blk: *mut HeapBlock) -> *mut Chunk {
    (blk as usize + BLOCK_HEADER_SIZE) as *mut Chunk
  }
}

/// Snapshot of one block, as reported by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  pub base: usize,
  pub size: usize,
  pub owned: bool,
  pub chunks: usize,
  pub free_chunks: usize,
  pub free_bytes: usize,
}

/// Header contents of the chunk behind a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
  pub size: usize,
  pub align_pad: usize,
  pub is_free: bool,
}

// =============================================================================
// State
// =============================================================================

struct HeapState {
  head: *mut HeapBlock,
  tail: *mut HeapBlock,
  free: *mut Chunk,
}

// SAFETY: blocks and chunks are reachable only through this state.
unsafe impl Send for HeapState {}

impl HeapState {
  const fn empty() -> Self {
    Self {
      head: ptr::null_mut(),
      tail: ptr::null_mut(),
      free: ptr::null_mut(),
    }
  }

  fn push_free(&mut self, c: *mut Chunk) {
    unsafe { (*c).next_free = self.free };
    self.free = c;
  }

  unsafe fn unlink_free(&mut self, c: *mut Chunk) -> bool {
    let mut prev: *mut Chunk = ptr::null_mut();
    let mut cur = self.free;
    while !cur.is_null() {
      let next = unsafe { (*cur).next_free };
      if cur == c {
        if prev.is_null() {
          self.free = next;
        } else {
          unsafe { (*prev).next_free = next };
        }
        unsafe { (*cur).next_free = ptr::null_mut() };
        return true;
      }
      prev = cur;
      cur = next;
    }
    false
  }

  /// Writes the block header, chains the block and frees its body as one chunk.
  unsafe fn setup_block(&mut self, base: *mut u8, size: usize, owned: bool) {
    let blk = base.cast::<HeapBlock>();
    unsafe {
      blk.write(HeapBlock {
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
    unsafe { self.reset_block(blk) };
  }

  unsafe fn reset_block(&mut self, blk: *mut HeapBlock) {
    let c = HeapBlock::first_chunk(blk);
    let body = unsafe { (*blk).size } - BLOCK_HEADER_SIZE;
    unsafe {
      c.write(Chunk {
        next_in_block: ptr::null_mut(),
        next_free: ptr::null_mut(),
        size: body - CHUNK_HEADER_SIZE,
        align_pad: 0,
        is_free: true,
      });
    }
    self.push_free(c);
  }

  /// Folds every free chunk that directly follows `c` into it.
  unsafe fn absorb_free_successors(&mut self, c: *mut Chunk) {
    loop {
      let n = unsafe { (*c).next_in_block };
      if n.is_null() || !unsafe { (*n).is_free } {
        return;
      }
      unsafe {
        self.unlink_free(n);
        (*c).size += CHUNK_HEADER_SIZE + (*n).size;
        (*c).next_in_block = (*n).next_in_block;
      }
    }
  }

  /// Cuts the tail of allocated chunk `c` past `user + used` into a free chunk
  /// when it is large enough to be useful.
  unsafe fn split(&mut self, c: *mut Chunk, user: *mut u8, used: usize) {
    let size = unsafe { (*c).size };
    if size < used || size - used < MIN_SPLIT {
      return;
    }
    let n = (user as usize + used) as *mut Chunk;
    unsafe {
      n.write(Chunk {
        next_in_block: (*c).next_in_block,
        next_free: ptr::null_mut(),
        size: size - used - CHUNK_HEADER_SIZE,
        align_pad: 0,
        is_free: true,
      });
      (*c).next_in_block = n;
      (*c).size = used;
      self.absorb_free_successors(n);
    }
    self.push_free(n);
  }

  /// First fit over the free list. `used` is already rounded to `CHUNK_ALIGN`.
  unsafe fn try_alloc(&mut self, used: usize, eff_align: usize) -> *mut u8 {
    let mut prev: *mut Chunk = ptr::null_mut();
    let mut c = self.free;
    while !c.is_null() {
      let body = Chunk::body(c);
      let avail = unsafe { (*c).size };
      let next_free = unsafe { (*c).next_free };

      if let Some(user) = checked_align_up(body + BACK_REF_SIZE, eff_align) {
        let pad = user - body;
        if pad <= avail && used <= avail - pad {
          if prev.is_null() {
            self.free = next_free;
          } else {
            unsafe { (*prev).next_free = next_free };
          }

          let user = user as *mut u8;
          unsafe {
            (*c).next_free = ptr::null_mut();
            (*c).size = avail - pad;
            (*c).align_pad = pad;
            (*c).is_free = false;
            self.split(c, user, used);
            write_back_ref(user, c);
          }
          return user;
        }
      }

      prev = c;
      c = next_free;
    }
    ptr::null_mut()
  }

  unsafe fn free_chunk(&mut self, c: *mut Chunk) {
    unsafe {
      #[cfg(feature = "debug-tripwire")]
      if (*c).is_free {
        panic!("heap: double free of chunk {c:p}");
      }

      (*c).size += (*c).align_pad;
      (*c).align_pad = 0;
      (*c).is_free = true;
      self.absorb_free_successors(c);
    }
    self.push_free(c);
  }
}

// =============================================================================
// Heap
// =============================================================================

/// Free-list allocator. See the [module docs](self).
///
/// Without a mutex the heap serves one caller at a time: a call that overlaps
/// another one from a different thread panics.
pub struct Heap<'a> {
  parent: Allocator<'a>,
  default_block_size: usize,
  state: Guarded<'a, HeapState>,
}

impl<'a> Heap<'a> {
  /// Creates an empty heap. Usable in a `static` together with a static
  /// [`Mutex`], which is how the [`GlobalAlloc`] impl is meant to be used.
  pub const fn new(parent: Allocator<'a>, mutex: Option<&'a Mutex>, default_block_size: usize) -> Self {
    Self {
      parent,
      default_block_size,
      state: Guarded::new(MutexSlot::from_option(mutex), HeapState::empty()),
    }
  }

  pub fn new_mutexed(parent: Allocator<'a>, default_block_size: usize) -> Self {
    Self {
      parent,
      default_block_size,
      state: Guarded::new(MutexSlot::owned(), HeapState::empty()),
    }
  }

  pub fn destroy(self) {
    drop(self);
  }

  /// Allocator view: `alloc` aligns to [`MIN_ALIGN`], `dealloc` frees.
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

  /// Adds a caller-owned region. Its body becomes one free chunk.
  ///
  /// # Safety
  ///
  /// `ptr` must be valid for reads and writes of `size` bytes until it is
  /// removed with [`Heap::remove_block`] or the heap is dropped.
  pub unsafe fn add_block(&self, ptr: *mut u8, size: usize) -> Result<()> {
    check_block(ptr, size, align_of::<HeapBlock>(), BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE)?;
    self.state.with(|st| unsafe { st.setup_block(ptr, size, false) });
    Ok(())
  }

  /// Detaches the block starting at `ptr` and purges its free chunks. Live
  /// allocations inside it become invalid. A block the heap obtained itself
  /// goes back to the parent.
  #[track_caller]
  pub fn remove_block(&self, ptr: *mut u8) -> bool {
    let site = CallSite::here();
    self.state.with(|st| {
      let mut prev: *mut HeapBlock = ptr::null_mut();
      let mut blk = st.head;
      while !blk.is_null() {
        let next = unsafe { (*blk).next };
        if blk.cast::<u8>() == ptr {
          let mut c = HeapBlock::first_chunk(blk);
          while !c.is_null() {
            unsafe {
              if (*c).is_free {
                st.unlink_free(c);
              }
              c = (*c).next_in_block;
            }
          }

          if prev.is_null() {
            st.head = next;
          } else {
            unsafe { (*prev).next = next };
          }
          if st.tail == blk {
            st.tail = prev;
          }

          let (owned, size) = unsafe { ((*blk).owned, (*blk).size) };
          if owned {
            log::trace!("heap: releasing {size}-byte block {blk:p} at {site}");
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

  #[track_caller]
  pub fn alloc(&self, size: usize, align: usize) -> *mut u8 {
    self.alloc_at(size, align, CallSite::here())
  }

  pub fn alloc_at(&self, size: usize, align: usize, site: CallSite) -> *mut u8 {
    if !align.is_power_of_two() {
      log::warn!("heap: alignment {align} is not a power of two at {site}");
      return ptr::null_mut();
    }
    self.state.with(|st| unsafe { self.alloc_locked(st, size, align, site) })
  }

  unsafe fn alloc_locked(&self, st: &mut HeapState, size: usize, align: usize, site: CallSite) -> *mut u8 {
    let eff_align = align.max(BACK_REF_SIZE);
    let Some(used) = checked_align_up(size.max(1), CHUNK_ALIGN) else {
      return ptr::null_mut();
    };

    let p = unsafe { st.try_alloc(used, eff_align) };
    if !p.is_null() || self.parent.is_null() {
      return p;
    }

    // Padding never exceeds `eff_align`, so this block always fits the request.
    let Some(needed) = (BLOCK_HEADER_SIZE + CHUNK_HEADER_SIZE)
      .checked_add(eff_align)
      .and_then(|v| v.checked_add(used))
    else {
      return ptr::null_mut();
    };
    let block_size = align_up(self.default_block_size.max(needed), CHUNK_ALIGN);

    let base = self.parent.alloc_at(block_size, site);
    if base.is_null() {
      log::warn!("heap: parent could not supply a {block_size}-byte block at {site}");
      return ptr::null_mut();
    }
    log::trace!("heap: grew by {block_size}-byte block {base:p} at {site}");

    unsafe {
      st.setup_block(base, block_size, true);
      st.try_alloc(used, eff_align)
    }
  }

  /// Returns an allocation to the free list. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  #[track_caller]
  pub unsafe fn dealloc(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    self.state.with(|st| unsafe { st.free_chunk(read_back_ref(ptr)) });
  }

  /// Resizes in place when the chunk is already large enough or the chunk
  /// after it is free and covers the difference; otherwise moves the data.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation of `old_size` bytes from this
  /// heap.
  #[track_caller]
  pub unsafe fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize) -> *mut u8 {
    unsafe { self.realloc_at(ptr, old_size, new_size, align, CallSite::here()) }
  }

  /// # Safety
  ///
  /// See [`Heap::realloc`].
  pub unsafe fn realloc_at(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize, site: CallSite) -> *mut u8 {
    if ptr.is_null() {
      return self.alloc_at(new_size, align, site);
    }
    if !align.is_power_of_two() {
      log::warn!("heap: alignment {align} is not a power of two at {site}");
      return ptr::null_mut();
    }

    self.state.with(|st| unsafe {
      let c = read_back_ref(ptr);
      if is_aligned(ptr as usize, align) {
        if new_size <= (*c).size {
          return ptr;
        }
        let n = (*c).next_in_block;
        if !n.is_null() && (*n).is_free && (*c).size + CHUNK_HEADER_SIZE + (*n).size >= new_size {
          st.unlink_free(n);
          (*c).size += CHUNK_HEADER_SIZE + (*n).size;
          (*c).next_in_block = (*n).next_in_block;
          if let Some(used) = checked_align_up(new_size, CHUNK_ALIGN) {
            st.split(c, ptr, used);
          }
          return ptr;
        }
      }

      let new_ptr = self.alloc_locked(st, new_size, align, site);
      if !new_ptr.is_null() {
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        st.free_chunk(c);
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
  /// See [`Heap::realloc`].
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
  // Lifecycle and introspection
  // ---------------------------------------------------------------------------

  /// Frees everything: each block becomes a single free chunk again.
  pub fn clear(&self) {
    self.state.with(|st| {
      st.free = ptr::null_mut();
      let mut blk = st.head;
      while !blk.is_null() {
        unsafe {
          st.reset_block(blk);
          blk = (*blk).next;
        }
      }
    });
  }

  /// Usable bytes on the free list.
  pub fn free_bytes(&self) -> usize {
    self.state.with(|st| {
      let mut total = 0;
      let mut c = st.free;
      while !c.is_null() {
        unsafe {
          total += (*c).size;
          c = (*c).next_free;
        }
      }
      total
    })
  }

  pub fn blocks(&self) -> Vec<BlockInfo> {
    self.state.with(|st| {
      let mut out = Vec::new();
      let mut blk = st.head;
      while !blk.is_null() {
        let mut info = BlockInfo {
          base: blk as usize,
          size: unsafe { (*blk).size },
          owned: unsafe { (*blk).owned },
          chunks: 0,
          free_chunks: 0,
          free_bytes: 0,
        };
        let mut c = HeapBlock::first_chunk(blk);
        while !c.is_null() {
          let chunk = unsafe { &*c };
          info.chunks += 1;
          if chunk.is_free {
            info.free_chunks += 1;
            info.free_bytes += chunk.size;
          }
          c = chunk.next_in_block;
        }
        out.push(info);
        blk = unsafe { (*blk).next };
      }
      out
    })
  }

  /// Decodes the back-reference in front of `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this heap.
  pub unsafe fn chunk_info(&self, ptr: *const u8) -> ChunkInfo {
    self.state.with(|_| unsafe {
      let c = &*read_back_ref(ptr);
      ChunkInfo {
        size: c.size,
        align_pad: c.align_pad,
        is_free: c.is_free,
      }
    })
  }
}

impl Drop for Heap<'_> {
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
    *st = HeapState::empty();

    if released + detached > 0 {
      log::debug!("heap: destroyed, {released} blocks released, {detached} detached");
    }
  }
}

impl RawAllocator for Heap<'_> {
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8 {
    self.alloc_at(size, MIN_ALIGN, site)
  }

  fn dealloc(&self, ptr: *mut u8, _size: usize, _site: CallSite) {
    // SAFETY: callers of the allocator view pass back pointers it handed out.
    unsafe { Heap::dealloc(self, ptr) }
  }

  fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize, site: CallSite) -> *mut u8 {
    // SAFETY: as above.
    unsafe { self.realloc_at(ptr, old_size, new_size, MIN_ALIGN, site) }
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Lets a heap serve as `#[global_allocator]`:
///
/// ```ignore
/// static LOCK: Mutex = Mutex::new();
/// #[global_allocator]
/// static GLOBAL: Heap<'static> = Heap::new(VirtualMemory::allocator(), Some(&LOCK), 1 << 20);
/// ```
///
/// The installed logger must not allocate while a heap lock is held, since
/// growth logs at `trace` level from inside the lock.
unsafe impl GlobalAlloc for Heap<'_> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    self.alloc_at(layout.size(), layout.align(), CallSite::here())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { Heap::dealloc(self, ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    unsafe { self.realloc_at(ptr, layout.size(), new_size, layout.align(), CallSite::here()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vmem::VirtualMemory;

  fn heap() -> Heap<'static> {
    Heap::new(VirtualMemory::allocator(), None, 4096)
  }

  #[test]
  fn test_header_sizes() {
    assert_eq!(BLOCK_HEADER_SIZE % CHUNK_ALIGN, 0);
    assert_eq!(CHUNK_HEADER_SIZE % CHUNK_ALIGN, 0);
    assert_eq!(BACK_REF_SIZE, size_of::<usize>());
  }

  #[test]
  fn test_alloc_alignment_and_back_ref() {
    let heap = heap();
    for (size, align) in [(1, 1), (24, 8), (100, 16), (7, 64), (300, 256)] {
      let p = heap.alloc(size, align);
      assert!(!p.is_null());
      assert_eq!(p as usize % align, 0);
      let info = unsafe { heap.chunk_info(p) };
      assert!(info.size >= size);
      assert!(info.align_pad >= BACK_REF_SIZE);
      assert!(!info.is_free);
    }
    assert_eq!(heap.blocks().len(), 1);
  }

  #[test]
  fn test_dealloc_reuses_and_splits() {
    let heap = heap();
    let p1 = heap.alloc(100, 8);
    let p2 = heap.alloc(200, 8);
    unsafe { heap.dealloc(p1) };

    let p3 = heap.alloc(50, 8);
    assert_eq!(p3, p1);
    let p4 = heap.alloc(60, 8);
    assert_ne!(p4, p2);
    assert!(p4 as usize > p1 as usize + 50);
  }

  #[test]
  fn test_forward_coalescing() {
    let heap = heap();
    let a = heap.alloc(64, 8);
    let b = heap.alloc(64, 8);
    let c = heap.alloc(64, 8);
    let _guard = heap.alloc(64, 8);

    unsafe {
      heap.dealloc(c);
      heap.dealloc(b);
      heap.dealloc(a);
    }
    let info = heap.blocks()[0];
    // a, b and c folded into one chunk, followed by the guard and the tail.
    assert_eq!(info.chunks, 3);
    assert_eq!(info.free_chunks, 2);

    let big = heap.alloc(64 * 3 + 2 * CHUNK_HEADER_SIZE, 8);
    assert_eq!(big, a);
  }

  #[test]
  fn test_free_list_accounts_for_every_byte() {
    let heap = heap();
    let ptrs: Vec<_> = (1..40).map(|i| heap.alloc(i * 13, 8)).collect();
    for p in ptrs {
      unsafe { heap.dealloc(p) };
    }
    for b in heap.blocks() {
      assert_eq!(b.chunks, b.free_chunks);
      assert_eq!(b.free_bytes + b.chunks * CHUNK_HEADER_SIZE, b.size - BLOCK_HEADER_SIZE);
    }
  }

  #[test]
  fn test_realloc_in_place_and_moving() {
    let heap = heap();
    let p = heap.alloc(40, 8);
    unsafe { p.write_bytes(0x11, 40) };

    // Shrinking and growing within the chunk keep the pointer.
    assert_eq!(unsafe { heap.realloc(p, 40, 10, 8) }, p);
    let q = unsafe { heap.realloc(p, 40, 400, 8) };
    assert_eq!(q, p, "the free tail follows the chunk");

    let _blocker = heap.alloc(8, 8);
    let r = unsafe { heap.realloc(q, 400, 2000, 8) };
    assert_ne!(r, q);
    assert!(unsafe { core::slice::from_raw_parts(r, 40) }.iter().all(|&b| b == 0x11));
  }

  #[test]
  fn test_grows_for_large_aligned_requests() {
    let heap = heap();
    let p = heap.alloc(10_000, 4096);
    assert!(!p.is_null());
    assert_eq!(p as usize % 4096, 0);
    let info = unsafe { heap.chunk_info(p) };
    assert!(info.size >= 10_000);
  }

  #[test]
  fn test_clear_collapses_blocks() {
    let heap = heap();
    for _ in 0..10 {
      heap.alloc(1000, 8);
    }
    let count = heap.blocks().len();
    heap.clear();
    let blocks = heap.blocks();
    assert_eq!(blocks.len(), count);
    assert!(blocks.iter().all(|b| b.chunks == 1 && b.free_chunks == 1));
  }

  #[test]
  fn test_caller_block_add_and_remove() {
    let mut storage = vec![0u64; 256];
    let base = storage.as_mut_ptr().cast::<u8>();
    let heap = Heap::new(Allocator::null(), None, 0);

    unsafe { heap.add_block(base, 2048).unwrap() };
    let p = heap.alloc(100, 8);
    assert!(p as usize > base as usize && (p as usize) < base as usize + 2048);
    unsafe { heap.dealloc(p) };

    assert!(heap.remove_block(base));
    assert_eq!(heap.free_bytes(), 0);
    assert!(heap.alloc(8, 8).is_null());
  }

  #[test]
  fn test_global_alloc_bridge() {
    let heap = Heap::new_mutexed(VirtualMemory::allocator(), 1 << 16);
    let layout = Layout::from_size_align(48, 32).unwrap();
    unsafe {
      let p = GlobalAlloc::alloc(&heap, layout);
      assert_eq!(p as usize % 32, 0);
      p.write_bytes(9, 48);
      let q = GlobalAlloc::realloc(&heap, p, layout, 4096);
      assert_eq!(q as usize % 32, 0);
      assert_eq!(*q.add(47), 9);
      GlobalAlloc::dealloc(&heap, q, Layout::from_size_align(4096, 32).unwrap());
    }
  }
}
