//! Checkpoint / rewind over an [`Arena`].
//!
//! A [`Scratch`] remembers the arena's tail block and its cursor. Ending it
//! (explicitly or by drop) hands every block appended since then back to the
//! parent and rewinds the saved tail.
//!
//! Only the tail is rewound. An allocation that lands in an earlier block with
//! room to spare stays there after the scratch ends, so a scratch is best
//! begun on a clean tail or on an arena dedicated to scratch work.

use core::ptr;

use crate::allocator::{Allocator, CallSite};
use crate::arena::{Arena, ArenaBlock};

pub struct Scratch<'s, 'a> {
  arena: &'s Arena<'a>,
  tail: *mut ArenaBlock,
  tail_used: usize,
  site: CallSite,
}

impl<'s, 'a> Scratch<'s, 'a> {
  #[track_caller]
  pub fn begin(arena: &'s Arena<'a>) -> Self {
    let site = CallSite::here();
    let (tail, tail_used) = arena.state.with(|st| {
      let used = if st.tail.is_null() { 0 } else { unsafe { (*st.tail).used } };
      (st.tail, used)
    });
    Self {
      arena,
      tail,
      tail_used,
      site,
    }
  }

  pub fn arena(&self) -> &'s Arena<'a> {
    self.arena
  }

  pub fn allocator(&self) -> Allocator<'s> {
    self.arena.allocator()
  }

  #[track_caller]
  pub fn alloc(&self, size: usize, align: usize) -> *mut u8 {
    self.arena.alloc_at(size, align, CallSite::here())
  }

  /// Rewinds the arena. Same as dropping the scratch.
  pub fn end(self) {}

  fn rewind(&self) {
    let arena = self.arena;
    let site = self.site;
    arena.state.with(|st| {
      let mut blk = if self.tail.is_null() { st.head } else { unsafe { (*self.tail).next } };
      let mut freed = 0usize;
      while !blk.is_null() {
        let next = unsafe { (*blk).next };
        unsafe { arena.release_block(blk, site) };
        freed += 1;
        blk = next;
      }

      if self.tail.is_null() {
        st.head = ptr::null_mut();
      } else {
        unsafe {
          (*self.tail).next = ptr::null_mut();
          (*self.tail).used = self.tail_used;
        }
      }
      st.tail = self.tail;

      log::trace!("scratch begun at {site}: rewound, {freed} blocks dropped");
    });
  }
}

impl Drop for Scratch<'_, '_> {
  fn drop(&mut self) {
    self.rewind();
  }
}

impl<'a> Arena<'a> {
  /// Shorthand for [`Scratch::begin`].
  #[track_caller]
  pub fn scratch(&self) -> Scratch<'_, 'a> {
    Scratch::begin(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arena::BLOCK_HEADER_SIZE;
  use crate::vmem::VirtualMemory;

  #[test]
  fn test_rewinds_clean_tail_and_drops_grown_blocks() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    arena.alloc(1, 1);
    arena.clear();
    let before = arena.blocks();
    assert_eq!(before.len(), 1);

    let scratch = arena.scratch();
    assert!(!scratch.alloc(500, 8).is_null());
    assert!(!scratch.alloc(5000, 8).is_null());
    assert_eq!(arena.blocks().len(), 2);
    scratch.end();

    let after = arena.blocks();
    assert_eq!(after, before);
    assert_eq!(after[0].used, BLOCK_HEADER_SIZE);

    let p = arena.alloc(100, 8) as usize;
    assert!(p > after[0].base && p < after[0].base + after[0].size);
  }

  #[test]
  fn test_empty_arena_is_reset_to_empty() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    {
      let scratch = Scratch::begin(&arena);
      scratch.alloc(64, 8);
      scratch.alloc(8000, 8);
      assert_eq!(arena.blocks().len(), 2);
    }
    assert!(arena.blocks().is_empty());

    // Still usable after the reset.
    assert!(!arena.alloc(16, 8).is_null());
    assert_eq!(arena.blocks().len(), 1);
  }

  #[test]
  fn test_nested_scratches() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    arena.alloc(10, 8);
    let base_used = arena.used_bytes();

    let outer = arena.scratch();
    outer.alloc(100, 8);
    let outer_used = arena.used_bytes();
    {
      let inner = arena.scratch();
      inner.alloc(200, 8);
      inner.alloc(6000, 8);
    }
    assert_eq!(arena.used_bytes(), outer_used);
    outer.end();
    assert_eq!(arena.used_bytes(), base_used);
  }

  #[test]
  fn test_earlier_blocks_are_not_rewound() {
    let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
    arena.alloc(3000, 8);
    arena.alloc(3000, 8);
    let before = arena.blocks();

    let scratch = arena.scratch();
    scratch.alloc(100, 8);
    drop(scratch);

    let after = arena.blocks();
    assert_eq!(after[1], before[1]);
    assert_eq!(after[0].used, before[0].used + 100);
  }
}
