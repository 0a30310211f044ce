//! Open-addressing hash map with Robin Hood probing, keyed by `u64`.
//!
//! Every key has a home slot `hash_u64(key) & (capacity - 1)`. An incoming
//! entry takes the slot of any resident that sits closer to its own home, so
//! probe distances stay short and lookups can stop early. Removal shifts the
//! following run one slot back instead of leaving tombstones.
//!
//! The slot array comes from an [`Allocator`] and doubles once the load
//! reaches 75%.

use core::marker::PhantomData;
use core::mem::{MaybeUninit, align_of, size_of};
use core::ptr::NonNull;
use core::slice;

use crate::allocator::{Allocator, CallSite, MIN_ALIGN};
use crate::error::{Error, Result};

// =============================================================================
// Hash utilities
// =============================================================================

/// splitmix64 finaliser.
#[inline]
pub const fn hash_u64(mut x: u64) -> u64 {
  x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
  x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
  x ^ (x >> 31)
}

#[inline]
pub fn hash_ptr<T: ?Sized>(ptr: *const T) -> u64 {
  hash_u64(ptr.cast::<u8>() as usize as u64)
}

/// FNV-1a, 64-bit.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
  const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;
  bytes
    .iter()
    .fold(OFFSET, |h, &b| (h ^ b as u64).wrapping_mul(PRIME))
}

#[inline]
pub fn hash_str(s: &str) -> u64 {
  hash_bytes(s.as_bytes())
}

// =============================================================================
// Slots
// =============================================================================

#[repr(C)]
struct Slot<V> {
  key: u64,
  value: MaybeUninit<V>,
  probe_distance: u32,
  occupied: bool,
}

/// Position of one occupied slot, as reported by [`HashMap::slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
  pub index: usize,
  pub key: u64,
  pub probe_distance: u32,
}

/// Robin Hood insert into a zero-initialised or populated slot array.
/// Returns `true` for a new key, `false` when an existing value was replaced.
fn insert_into<V: Copy>(slots: &mut [Slot<V>], key: u64, value: V) -> bool {
  let mask = slots.len() - 1;
  let mut pos = hash_u64(key) as usize & mask;
  let mut incoming = Slot {
    key,
    value: MaybeUninit::new(value),
    probe_distance: 0,
    occupied: true,
  };

  loop {
    let slot = &mut slots[pos];
    if !slot.occupied {
      *slot = incoming;
      return true;
    }
    if slot.key == incoming.key {
      slot.value = incoming.value;
      return false;
    }
    if slot.probe_distance < incoming.probe_distance {
      core::mem::swap(slot, &mut incoming);
    }
    incoming.probe_distance += 1;
    pos = (pos + 1) & mask;
  }
}

// =============================================================================
// HashMap
// =============================================================================

/// `u64 -> V` map over an [`Allocator`]. Values are copied in and out.
pub struct HashMap<'a, V: Copy> {
  slots: NonNull<Slot<V>>,
  capacity: usize,
  count: usize,
  alloc: Allocator<'a>,
  _values: PhantomData<V>,
}

impl<'a, V: Copy> HashMap<'a, V> {
  pub const MIN_CAPACITY: usize = 16;

  /// Allocates a zeroed table of at least `min_capacity` slots, rounded up to
  /// a power of two and never below [`HashMap::MIN_CAPACITY`].
  #[track_caller]
  pub fn new(min_capacity: usize, alloc: Allocator<'a>) -> Result<Self> {
    let site = CallSite::here();
    if align_of::<Slot<V>>() > MIN_ALIGN {
      return Err(Error::InvalidAlignment(align_of::<Slot<V>>()));
    }
    let capacity = min_capacity
      .checked_next_power_of_two()
      .ok_or(Error::OutOfMemory { requested: min_capacity })?
      .max(Self::MIN_CAPACITY);
    let slots = Self::alloc_slots(alloc, capacity, site)?;
    Ok(Self {
      slots,
      capacity,
      count: 0,
      alloc,
      _values: PhantomData,
    })
  }

  fn alloc_slots(alloc: Allocator<'a>, capacity: usize, site: CallSite) -> Result<NonNull<Slot<V>>> {
    let p = alloc.calloc_at(capacity, size_of::<Slot<V>>(), site);
    NonNull::new(p.cast()).ok_or(Error::OutOfMemory {
      requested: capacity.saturating_mul(size_of::<Slot<V>>()),
    })
  }

  pub fn destroy(self) {
    drop(self);
  }

  pub fn len(&self) -> usize {
    self.count
  }

  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn allocator(&self) -> Allocator<'a> {
    self.alloc
  }

  /// Home slot of `key` at the current capacity.
  pub fn home(&self, key: u64) -> usize {
    hash_u64(key) as usize & (self.capacity - 1)
  }

  fn table(&self) -> &[Slot<V>] {
    // SAFETY: `capacity` slots were allocated zeroed, which is a valid empty
    // slot, and are only written through `table_mut`.
    unsafe { slice::from_raw_parts(self.slots.as_ptr(), self.capacity) }
  }

  fn table_mut(&mut self) -> &mut [Slot<V>] {
    unsafe { slice::from_raw_parts_mut(self.slots.as_ptr(), self.capacity) }
  }

  fn find(&self, key: u64) -> Option<usize> {
    let table = self.table();
    let mask = self.capacity - 1;
    let mut pos = hash_u64(key) as usize & mask;
    let mut dist = 0u32;
    loop {
      let slot = &table[pos];
      if !slot.occupied || slot.probe_distance < dist {
        return None;
      }
      if slot.key == key {
        return Some(pos);
      }
      pos = (pos + 1) & mask;
      dist += 1;
    }
  }

  // ---------------------------------------------------------------------------
  // Operations
  // ---------------------------------------------------------------------------

  /// Inserts or updates `key`. Fails only when the table had to grow and the
  /// allocator could not supply the larger one; the map is then unchanged.
  #[track_caller]
  pub fn set(&mut self, key: u64, value: V) -> Result<()> {
    if self.count >= self.capacity - self.capacity / 4 {
      self.rehash(self.capacity * 2, CallSite::here())?;
    }
    if insert_into(self.table_mut(), key, value) {
      self.count += 1;
    }
    Ok(())
  }

  pub fn get(&self, key: u64) -> Option<V> {
    if self.count == 0 {
      return None;
    }
    self.find(key).map(|i| {
      // SAFETY: occupied slots always hold an initialised value.
      unsafe { self.table()[i].value.assume_init() }
    })
  }

  pub fn has(&self, key: u64) -> bool {
    self.count > 0 && self.find(key).is_some()
  }

  /// Removes `key` with backward-shift deletion. Returns `false` if absent.
  pub fn remove(&mut self, key: u64) -> bool {
    if self.count == 0 {
      return false;
    }
    let Some(mut cur) = self.find(key) else {
      return false;
    };

    let mask = self.capacity - 1;
    let table = self.table_mut();
    loop {
      let next = (cur + 1) & mask;
      if !table[next].occupied || table[next].probe_distance == 0 {
        table[cur].occupied = false;
        table[cur].probe_distance = 0;
        table[cur].key = 0;
        break;
      }
      table[cur] = Slot {
        key: table[next].key,
        value: table[next].value,
        probe_distance: table[next].probe_distance - 1,
        occupied: true,
      };
      cur = next;
    }
    self.count -= 1;
    true
  }

  /// Empties the map and keeps its capacity.
  pub fn clear(&mut self) {
    unsafe { self.slots.as_ptr().write_bytes(0, self.capacity) };
    self.count = 0;
  }

  fn rehash(&mut self, new_capacity: usize, site: CallSite) -> Result<()> {
    let new_slots = Self::alloc_slots(self.alloc, new_capacity, site)?;
    // SAFETY: freshly allocated and zeroed.
    let new_table = unsafe { slice::from_raw_parts_mut(new_slots.as_ptr(), new_capacity) };
    for slot in self.table().iter().filter(|s| s.occupied) {
      insert_into(new_table, slot.key, unsafe { slot.value.assume_init() });
    }

    log::trace!(
      "hash_map: rehashed {} entries from {} to {new_capacity} slots at {site}",
      self.count,
      self.capacity
    );
    self.release_slots(site);
    self.slots = new_slots;
    self.capacity = new_capacity;
    Ok(())
  }

  fn release_slots(&mut self, site: CallSite) {
    self.alloc.dealloc_at(
      self.slots.as_ptr().cast(),
      self.capacity * size_of::<Slot<V>>(),
      site,
    );
  }

  // ---------------------------------------------------------------------------
  // Iteration
  // ---------------------------------------------------------------------------

  pub fn iter(&self) -> Iter<'_, V> {
    Iter {
      slots: self.table().iter(),
    }
  }

  pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
    self.iter().map(|(k, _)| k)
  }

  /// Every occupied slot with its index and probe distance.
  pub fn slots(&self) -> impl Iterator<Item = SlotInfo> + '_ {
    self
      .table()
      .iter()
      .enumerate()
      .filter(|(_, s)| s.occupied)
      .map(|(index, s)| SlotInfo {
        index,
        key: s.key,
        probe_distance: s.probe_distance,
      })
  }
}

impl<V: Copy> Drop for HashMap<'_, V> {
  fn drop(&mut self) {
    self.release_slots(CallSite::here());
  }
}

impl<'m, V: Copy> IntoIterator for &'m HashMap<'_, V> {
  type Item = (u64, V);
  type IntoIter = Iter<'m, V>;

  fn into_iter(self) -> Self::IntoIter {
    self.iter()
  }
}

pub struct Iter<'m, V> {
  slots: slice::Iter<'m, Slot<V>>,
}

impl<V: Copy> Iterator for Iter<'_, V> {
  type Item = (u64, V);

  fn next(&mut self) -> Option<Self::Item> {
    self
      .slots
      .by_ref()
      .find(|s| s.occupied)
      .map(|s| (s.key, unsafe { s.value.assume_init() }))
  }
}

/// Index-based iteration that does not borrow the map between steps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HashMapCursor {
  index: usize,
}

impl HashMapCursor {
  pub const fn new() -> Self {
    Self { index: 0 }
  }

  /// Next occupied entry at or after the cursor, or `None` at the end.
  pub fn next<V: Copy>(&mut self, map: &HashMap<'_, V>) -> Option<(u64, V)> {
    let table = map.table();
    while self.index < table.len() {
      let slot = &table[self.index];
      self.index += 1;
      if slot.occupied {
        return Some((slot.key, unsafe { slot.value.assume_init() }));
      }
    }
    None
  }
}
