//! Block address space and thread-local arenas.
//!
//! [`AddressSpace`] reserves one large virtual range and rents it out in
//! fixed-size, block-aligned blocks, committing memory on first use and
//! decommitting it lazily. [`Arena`] bump-allocates inside those blocks for a
//! single thread while letting any thread free what it handed out.
//! [`MemoryResource`] puts both behind one allocate/deallocate interface.
//!
//! ```
//! use blockarena::{arena_resource, default_resource};
//!
//! let arena = arena_resource();
//! let ptr = arena.allocate(64, 8).unwrap();
//! // Freed through the same resource, from any thread.
//! unsafe { arena.deallocate(ptr, 64, 8) };
//! assert!(!arena.is_equal(default_resource()));
//! ```

use core::ptr::NonNull;

pub mod arena;
mod boxed;
mod config;
mod error;
mod index;
mod os;
mod queue;
mod resource;
pub mod space;

pub use arena::Arena;
pub use boxed::TempBox;
pub use config::{
  ARENA_MAX_REQUEST, BLOCK_SIZE, BLOCK_SIZE_BITS, Config, DEFAULT_ALIGN, HYSTERESIS_BLOCKS,
  RESERVED_SIZE,
};
pub use error::{Error, Result};
pub use index::FreeBlockIndex;
pub use queue::TempQueue;
pub use resource::{ArenaResource, MemoryResource, SystemResource, TempAlloc};
pub use space::{AddressSpace, BlockId, Stats};

use resource::{ARENA_RESOURCE, SYSTEM_RESOURCE};

// =============================================================================
// Blocks
// =============================================================================

/// Rents a block from the global address space.
///
/// Aborts the process if no block can be committed.
pub fn rent_block() -> NonNull<u8> {
  AddressSpace::global().rent()
}

/// Returns a block obtained from [`rent_block`].
///
/// ```
/// let block = blockarena::rent_block();
/// unsafe { block.as_ptr().write(1) };
/// unsafe { blockarena::return_block(block) };
/// ```
///
/// Returning is not a safe operation:
///
/// ```compile_fail,E0133
/// let block = blockarena::rent_block();
/// blockarena::return_block(block);
/// ```
///
/// # Safety
///
/// `block` must be exactly a value returned by [`rent_block`] that has not
/// been returned yet, and nothing may touch the block afterwards.
pub unsafe fn return_block(block: NonNull<u8>) {
  unsafe { AddressSpace::global().release(block) }
}

// =============================================================================
// Resources
// =============================================================================

/// Resource backed by the calling thread's arena.
pub fn arena_resource() -> &'static dyn MemoryResource {
  &ARENA_RESOURCE
}

/// Resource backed by the system heap.
pub fn default_resource() -> &'static dyn MemoryResource {
  &SYSTEM_RESOURCE
}
