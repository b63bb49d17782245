use crate::{Error, Result, arena::ARENA_HEADER_SIZE};

// =============================================================================
// Constants
// =============================================================================

pub const BLOCK_SIZE_BITS: usize = 22;
/// Size of one block handed out by the address space (4MB).
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_BITS;

pub const RESERVED_SIZE: usize = 1 << 30; // 1GB

/// Committed blocks kept above the frontier before decommitting.
pub const HYSTERESIS_BLOCKS: u32 = 5;

/// Largest request served from a thread arena (256KB).
pub const ARENA_MAX_REQUEST: usize = 1 << 18;

/// Maximum scalar alignment. Arena allocations are always aligned to this.
pub const DEFAULT_ALIGN: usize = 16;

const _: () = assert!(BLOCK_SIZE.is_power_of_two());
const _: () = assert!(RESERVED_SIZE % BLOCK_SIZE == 0);
const _: () = assert!(RESERVED_SIZE / BLOCK_SIZE == 256);
const _: () = assert!(ARENA_MAX_REQUEST + ARENA_HEADER_SIZE <= BLOCK_SIZE);
const _: () = assert!(DEFAULT_ALIGN.is_power_of_two());

// =============================================================================
// Config
// =============================================================================

/// Parameters of an [`AddressSpace`](crate::AddressSpace) and the arenas built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Size and alignment of every block.
  pub block_size: usize,
  /// Bytes of virtual address space reserved up front.
  pub reserved_size: usize,
  /// Committed-but-unused blocks tolerated above the frontier.
  pub hysteresis: u32,
  /// Requests above this size bypass the arena.
  pub arena_max_request: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      block_size: BLOCK_SIZE,
      reserved_size: RESERVED_SIZE,
      hysteresis: HYSTERESIS_BLOCKS,
      arena_max_request: ARENA_MAX_REQUEST,
    }
  }
}

impl Config {
  #[must_use]
  pub fn with_block_size(mut self, size: usize) -> Self {
    self.block_size = size;
    self
  }

  #[must_use]
  pub fn with_reserved_size(mut self, size: usize) -> Self {
    self.reserved_size = size;
    self
  }

  /// Shorthand for reserving exactly `blocks` blocks of the current size.
  #[must_use]
  pub fn with_max_blocks(mut self, blocks: usize) -> Self {
    self.reserved_size = blocks.saturating_mul(self.block_size);
    self
  }

  #[must_use]
  pub fn with_hysteresis(mut self, blocks: u32) -> Self {
    self.hysteresis = blocks;
    self
  }

  #[must_use]
  pub fn with_arena_max_request(mut self, size: usize) -> Self {
    self.arena_max_request = size;
    self
  }

  /// Number of blocks the reservation can hold.
  #[inline]
  pub fn max_blocks(&self) -> usize {
    self.reserved_size / self.block_size
  }

  pub fn validate(&self) -> Result<()> {
    if !self.block_size.is_power_of_two() {
      return Err(Error::InvalidConfig(format!(
        "block_size {} is not a power of two",
        self.block_size
      )));
    }
    let page = crate::os::page_size();
    if self.block_size < page {
      return Err(Error::InvalidConfig(format!(
        "block_size {} is smaller than the page size {page}",
        self.block_size
      )));
    }
    // Per-block allocation counts must fit the arena's i32 counter.
    if self.block_size / DEFAULT_ALIGN > i32::MAX as usize {
      return Err(Error::InvalidConfig(format!(
        "block_size {} is too large",
        self.block_size
      )));
    }
    if self.reserved_size == 0
      || self.reserved_size % self.block_size != 0
      || self.reserved_size.checked_add(self.block_size).is_none()
    {
      return Err(Error::InvalidConfig(format!(
        "reserved_size {} is not a non-zero multiple of block_size {}",
        self.reserved_size, self.block_size
      )));
    }
    // One id is kept back as the index's nil link.
    if self.max_blocks() >= u32::MAX as usize {
      return Err(Error::InvalidConfig(format!(
        "reservation holds {} blocks, more than block ids can address",
        self.max_blocks()
      )));
    }
    if self.arena_max_request == 0 || self.arena_max_request > self.block_size - ARENA_HEADER_SIZE {
      return Err(Error::InvalidConfig(format!(
        "arena_max_request {} must be in 1..={}",
        self.arena_max_request,
        self.block_size - ARENA_HEADER_SIZE
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_is_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.max_blocks(), 256);
  }

  #[test]
  fn rejects_bad_block_size() {
    let err = Config::default().with_block_size(3 << 20).validate().unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
  }

  #[test]
  fn rejects_partial_block_reservation() {
    let config = Config::default().with_reserved_size(BLOCK_SIZE * 3 + 1);
    assert!(config.validate().is_err());
  }

  #[test]
  fn rejects_arena_request_larger_than_block() {
    let config = Config::default()
      .with_block_size(1 << 16)
      .with_max_blocks(4)
      .with_arena_max_request(1 << 16);
    assert!(config.validate().is_err());
    config.with_arena_max_request(1 << 12).validate().unwrap();
  }
}
