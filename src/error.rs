//! Error types for the address space and memory resources.

use std::io;
use thiserror::Error;

use crate::space::BlockId;

/// Result type for fallible allocator operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// The initial address space reservation failed.
  #[error("failed to reserve {size} bytes of address space: {source}")]
  Reserve { size: usize, source: io::Error },

  /// The OS refused to back a block with memory.
  #[error("failed to commit block {block}: {source}")]
  Commit { block: BlockId, source: io::Error },

  /// Every block of the reservation is in use.
  #[error("address space exhausted: all {capacity} blocks are in use")]
  Exhausted { capacity: usize },

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  /// The global address space was already built with another configuration.
  #[error("global address space is already initialized")]
  AlreadyInitialized,

  /// The request is above the arena's size limit.
  #[error("{bytes} bytes exceeds the arena request limit of {limit}")]
  TooLarge { bytes: usize, limit: usize },

  /// The system heap cannot represent the size and alignment pair.
  #[error("invalid layout: {bytes} bytes aligned to {align}")]
  Layout { bytes: usize, align: usize },

  /// The system heap returned null.
  #[error("out of memory allocating {bytes} bytes aligned to {align}")]
  OutOfMemory { bytes: usize, align: usize },
}
