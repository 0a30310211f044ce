use core::ptr::NonNull;

use crate::error::{Error, Result};

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Like [`align_up`], but returns `None` instead of wrapping past `usize::MAX`.
#[inline(always)]
pub const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}

#[inline(always)]
pub fn is_aligned(addr: usize, align: usize) -> bool {
  addr & (align - 1) == 0
}

/// Validates a caller-supplied block for `add_block`.
pub(crate) fn check_block(ptr: *mut u8, size: usize, align: usize, header: usize) -> Result<()> {
  let addr = NonNull::new(ptr)
    .map(|p| p.as_ptr() as usize)
    .ok_or(Error::NullPointer("block"))?;
  if !is_aligned(addr, align) {
    return Err(Error::MisalignedBlock { addr, align });
  }
  if size <= header {
    return Err(Error::BlockTooSmall { size, min: header });
  }
  Ok(())
}
