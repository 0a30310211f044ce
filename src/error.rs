//! Error taxonomy for the fallible, non-allocating entry points.
//!
//! Allocation paths do not use this type: they return a null pointer on
//! failure. Errors show up where a caller can act on them, i.e. construction,
//! block registration, virtual-memory calls and hash-map growth.

use std::io;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("out of memory: {requested} bytes requested")]
  OutOfMemory { requested: usize },

  #[error("alignment {0} is not a power of two or is too small")]
  InvalidAlignment(usize),

  #[error("{0} must be greater than zero")]
  ZeroSize(&'static str),

  #[error("block of {size} bytes cannot hold its {min}-byte header")]
  BlockTooSmall { size: usize, min: usize },

  #[error("block at {addr:#x} is not aligned to {align}")]
  MisalignedBlock { addr: usize, align: usize },

  #[error("{0} pointer is null")]
  NullPointer(&'static str),

  #[error("vmem {op} failed")]
  Vmem {
    op: &'static str,
    #[source]
    source: io::Error,
  },
}

impl Error {
  /// Captures `errno` for a failed virtual-memory call.
  pub(crate) fn last_os(op: &'static str) -> Self {
    Self::Vmem {
      op,
      source: io::Error::last_os_error(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_display() {
    let err = Error::OutOfMemory { requested: 64 };
    assert_eq!(err.to_string(), "out of memory: 64 bytes requested");

    let err = Error::BlockTooSmall { size: 8, min: 32 };
    assert_eq!(err.to_string(), "block of 8 bytes cannot hold its 32-byte header");

    let err = Error::ZeroSize("ring capacity");
    assert_eq!(err.to_string(), "ring capacity must be greater than zero");

    let err = Error::NullPointer("ring buffer");
    assert_eq!(err.to_string(), "ring buffer pointer is null");
  }

  #[test]
  fn test_vmem_source_is_kept() {
    let err = Error::Vmem {
      op: "commit",
      source: io::Error::from_raw_os_error(libc::ENOMEM),
    };
    let source = std::error::Error::source(&err).map(|s| s.to_string());
    assert!(source.is_some());
    assert_eq!(err.to_string(), "vmem commit failed");
  }
}
