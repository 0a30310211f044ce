//! Composable allocators over OS virtual memory.
//!
//! ```text
//!   HashMap ──┐
//!   Ring ─────┤
//!   Pool ─────┼──► Allocator<'a> (parent) ──► Heap / Arena / Pool ──► ... ──► VirtualMemory
//!   Heap ─────┤                                   ▲
//!   Arena ────┘                                   └── Scratch (checkpoint / rewind)
//! ```
//!
//! Every allocator takes its backing memory from a parent [`Allocator`] and
//! exposes itself as one through `allocator()`, so they stack freely. Thread
//! safety is opt-in per instance: pass a [`Mutex`] (or use a `*_mutexed`
//! constructor) and every entry point locks it; without one an instance
//! serves a single caller at a time and panics on overlapping calls.

pub mod allocator;
pub mod arena;
pub mod error;
pub mod hash_map;
pub mod heap;
pub mod pool;
pub mod ring;
pub mod scratch;
pub mod sync;
pub mod util;
pub mod vmem;

pub use allocator::{Allocator, CallSite, MIN_ALIGN, RawAllocator};
pub use arena::Arena;
pub use error::{Error, Result};
pub use hash_map::{HashMap, HashMapCursor, hash_bytes, hash_ptr, hash_str, hash_u64};
pub use heap::Heap;
pub use pool::Pool;
pub use ring::Ring;
pub use scratch::Scratch;
pub use sync::{Mutex, MutexGuard, MutexSlot};
pub use vmem::VirtualMemory;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(MIN_ALIGN.is_power_of_two());
const _: () = assert!(MIN_ALIGN >= core::mem::size_of::<*mut u8>());
const _: () = assert!(arena::BLOCK_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(heap::BLOCK_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(heap::CHUNK_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(pool::BLOCK_HEADER_SIZE % MIN_ALIGN == 0);
