use std::alloc::{GlobalAlloc, Layout};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use based::{Allocator, Arena, CallSite, HashMap, Heap, Mutex, Pool, RawAllocator, Ring, VirtualMemory};

/// Parent that parks its first `alloc` between two barriers.
struct Gate {
  armed: AtomicBool,
  entered: Barrier,
  release: Barrier,
}

impl RawAllocator for Gate {
  fn alloc(&self, size: usize, site: CallSite) -> *mut u8 {
    if self.armed.swap(false, Ordering::SeqCst) {
      self.entered.wait();
      self.release.wait();
    }
    VirtualMemory::allocator().alloc_at(size, site)
  }

  fn dealloc(&self, ptr: *mut u8, size: usize, site: CallSite) {
    VirtualMemory::allocator().dealloc_at(ptr, size, site)
  }
}

#[test]
fn allocators_are_send_and_sync() {
  fn assert_send_sync<T: Send + Sync>() {}
  assert_send_sync::<Arena<'static>>();
  assert_send_sync::<Heap<'static>>();
  assert_send_sync::<Pool<'static>>();
  assert_send_sync::<Ring<'static>>();
  assert_send_sync::<Allocator<'static>>();
}

#[test]
fn unlocked_heap_rejects_an_overlapping_call() {
  let gate = Gate {
    armed: AtomicBool::new(true),
    entered: Barrier::new(2),
    release: Barrier::new(2),
  };
  let heap = Heap::new(Allocator::new(&gate), None, 4096);

  thread::scope(|s| {
    // Holds the heap's state while its growth waits on the gate.
    let grower = s.spawn(|| heap.alloc(64, 8) as usize);
    s.spawn(|| {
      gate.entered.wait();
      let overlap = panic::catch_unwind(AssertUnwindSafe(|| heap.alloc(64, 8)));
      assert!(overlap.is_err());
      gate.release.wait();
    });
    assert_ne!(grower.join().unwrap(), 0);
  });

  // Sequential use is unaffected.
  let p = heap.alloc(32, 8);
  assert!(!p.is_null());
  unsafe { heap.dealloc(p) };
  assert_eq!(heap.blocks().len(), 1);
}

#[test]
fn heap_on_arena_on_vmem() {
  let arena = Arena::new(VirtualMemory::allocator(), None, 1 << 16);
  let heap = Heap::new(arena.allocator(), None, 4096);
  assert_eq!(heap.parent(), arena.allocator());

  let ptrs: Vec<*mut u8> = (0..64).map(|i| heap.alloc(32 + i * 8, 16)).collect();
  assert!(ptrs.iter().all(|&p| !p.is_null() && p as usize % 16 == 0));

  let arena_blocks = arena.blocks();
  assert_eq!(arena_blocks.len(), 1);
  let (lo, hi) = (arena_blocks[0].base, arena_blocks[0].base + arena_blocks[0].size);
  assert!(ptrs.iter().all(|&p| (lo..hi).contains(&(p as usize))));

  for p in ptrs {
    unsafe { heap.dealloc(p) };
  }
  let used = arena.used_bytes();
  drop(heap);
  // Heap blocks handed back to an arena are simply abandoned.
  assert_eq!(arena.used_bytes(), used);
}

#[test]
fn pool_and_map_on_heap() {
  let heap = Heap::new(VirtualMemory::allocator(), None, 1 << 14);
  let pool = Pool::new(heap.allocator(), None, 1024, 40, 8).unwrap();
  let mut map = HashMap::new(16, heap.allocator()).unwrap();

  for k in 0..500u64 {
    let slot = pool.alloc();
    assert!(!slot.is_null());
    unsafe { slot.cast::<u64>().write(k) };
    map.set(k, slot).unwrap();
  }
  assert_eq!(map.len(), 500);
  assert!(map.capacity() >= 512);

  for k in (0..500u64).step_by(5) {
    let slot = map.get(k).unwrap();
    assert_eq!(unsafe { slot.cast::<u64>().read() }, k);
    assert!(map.remove(k));
    unsafe { pool.dealloc(slot) };
  }
  assert_eq!(map.len(), 400);
}

#[test]
fn ring_storage_from_an_arena() {
  let arena = Arena::new(VirtualMemory::allocator(), None, 4096);
  let ring = Ring::with_allocator(arena.allocator(), 100, None).unwrap();
  assert_eq!(ring.write(&[7u8; 150]), 100);
  assert_eq!(arena.blocks().len(), 1);
}

#[test]
fn mutexed_heap_across_threads() {
  let heap = Heap::new_mutexed(VirtualMemory::allocator(), 1 << 16);
  thread::scope(|s| {
    for t in 0..4u8 {
      let heap = &heap;
      s.spawn(move || {
        for round in 0..200usize {
          let size = 16 + (round % 13) * 24;
          let p = heap.alloc(size, 8);
          assert!(!p.is_null());
          unsafe {
            p.write_bytes(t, size);
            assert!(core::slice::from_raw_parts(p, size).iter().all(|&b| b == t));
            heap.dealloc(p);
          }
        }
      });
    }
  });
  for b in heap.blocks() {
    assert_eq!(b.chunks, b.free_chunks);
  }
}

#[test]
fn pools_sharing_one_mutex_over_a_mutexed_arena() {
  // The pools lock `LOCK` while growing from the arena, which locks its own.
  static LOCK: Mutex = Mutex::new();
  let arena = Arena::new_mutexed(VirtualMemory::allocator(), 4096);
  let small = Pool::new(arena.allocator(), Some(&LOCK), 2048, 16, 16).unwrap();
  let large = Pool::new(arena.allocator(), Some(&LOCK), 2048, 200, 8).unwrap();

  thread::scope(|s| {
    for t in 0..4 {
      let (arena, small, large) = (&arena, &small, &large);
      s.spawn(move || {
        for _ in 0..100 {
          assert!(!arena.alloc(24, 8).is_null());
          let pool = if t % 2 == 0 { small } else { large };
          let p = pool.alloc();
          assert_eq!(p as usize % pool.object_align(), 0);
          unsafe { pool.dealloc(p) };
        }
      });
    }
  });
  assert!(!LOCK.is_locked());
}

#[test]
fn mutexed_ring_producer_consumer() {
  let ring = Ring::with_allocator_mutexed(VirtualMemory::allocator(), 256).unwrap();
  let total = 10_000usize;

  thread::scope(|s| {
    s.spawn(|| {
      let mut sent = 0;
      while sent < total {
        let byte = [(sent % 251) as u8];
        sent += ring.write(&byte);
      }
    });
    s.spawn(|| {
      let mut received = 0;
      let mut byte = [0u8; 1];
      while received < total {
        if ring.read(&mut byte) == 1 {
          assert_eq!(byte[0], (received % 251) as u8);
          received += 1;
        }
      }
    });
  });
  assert!(ring.is_empty());
}

#[test]
fn heap_as_global_alloc() {
  static LOCK: Mutex = Mutex::new();
  static GLOBAL: Heap<'static> = Heap::new(VirtualMemory::allocator(), Some(&LOCK), 1 << 16);

  thread::scope(|s| {
    for t in 1..=4usize {
      s.spawn(move || unsafe {
        let layout = Layout::from_size_align(t * 24, 8 << t).unwrap();
        let p = GlobalAlloc::alloc(&GLOBAL, layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % layout.align(), 0);
        p.write_bytes(t as u8, layout.size());

        let grown = GlobalAlloc::realloc(&GLOBAL, p, layout, layout.size() * 10);
        assert_eq!(*grown, t as u8);
        GlobalAlloc::dealloc(&GLOBAL, grown, Layout::from_size_align(layout.size() * 10, layout.align()).unwrap());

        let z = GLOBAL.alloc_zeroed(Layout::from_size_align(64, 8).unwrap());
        assert!(core::slice::from_raw_parts(z, 64).iter().all(|&b| b == 0));
        GlobalAlloc::dealloc(&GLOBAL, z, Layout::from_size_align(64, 8).unwrap());
      });
    }
  });
}

#[test]
fn null_parent_only_serves_added_blocks() {
  let mut storage = vec![0u64; 512];
  let heap = Heap::new(Allocator::null(), None, 0);
  unsafe { heap.add_block(storage.as_mut_ptr().cast(), 4096).unwrap() };

  let p = heap.alloc(1000, 8);
  assert!(!p.is_null());
  assert!(heap.alloc(8000, 8).is_null());
  unsafe { heap.dealloc(p) };
  assert_eq!(heap.blocks().len(), 1);
}
