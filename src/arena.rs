//! Thread-local bump arenas over rented blocks.
//!
//! The owning thread bumps a private cursor and only counts what it hands out.
//! Frees may come from any thread and decrement the block's `flying` counter.
//! When the owner moves to a new block it publishes its count with one
//! `fetch_add`. Whoever brings the counter to zero returns the block:
//! - a free observing `1` before its decrement, or
//! - the publish itself, when every allocation was already freed before it.

use core::{
  cell::{Cell, UnsafeCell},
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicI32, Ordering},
};

use crate::{AddressSpace, DEFAULT_ALIGN, Error, Result, space::align_up};

/// Bytes reserved at the start of every arena block.
pub(crate) const ARENA_HEADER_SIZE: usize = align_up(size_of::<ArenaHeader>(), DEFAULT_ALIGN);

const _: () = assert!(ARENA_HEADER_SIZE == DEFAULT_ALIGN);

// =============================================================================
// Types
// =============================================================================

/// Sits at offset 0 of a block while it is used as an arena.
#[repr(C)]
struct ArenaHeader {
  /// Published allocations minus frees.
  flying: AtomicI32,
}

/// Owner-thread bump state.
struct Cursor {
  current: Option<NonNull<ArenaHeader>>,
  /// Next free offset inside `current`.
  head: usize,
  /// Allocations handed out from `current` and not yet published.
  count: i32,
}

impl Cursor {
  const fn new() -> Self {
    Self {
      current: None,
      head: ARENA_HEADER_SIZE,
      count: 0,
    }
  }

  /// Starts bumping from a freshly rented block.
  fn claim(&mut self, block: NonNull<u8>) {
    let header = block.cast::<ArenaHeader>();
    unsafe {
      header.write(ArenaHeader {
        flying: AtomicI32::new(0),
      })
    };
    self.current = Some(header);
    self.head = ARENA_HEADER_SIZE;
    self.count = 0;
  }

  #[inline]
  fn bump(&mut self, size: usize, block_size: usize) -> Option<NonNull<u8>> {
    let header = self.current?;
    let end = self.head + align_up(size.max(1), DEFAULT_ALIGN);
    if end > block_size {
      return None;
    }
    let ptr = unsafe { header.cast::<u8>().add(self.head) };
    self.head = end;
    self.count += 1;
    Some(ptr)
  }

  /// Publishes the local count and detaches from the current block.
  ///
  /// Returns the block if every allocation from it was freed before the
  /// publish. The caller then owns its release.
  fn flush(&mut self) -> Option<NonNull<u8>> {
    let header = self.current.take()?;
    let count = self.count;
    self.head = ARENA_HEADER_SIZE;
    self.count = 0;

    let prev = unsafe { header.as_ref() }
      .flying
      .fetch_add(count, Ordering::SeqCst);
    (prev == -count).then_some(header.cast())
  }
}

// =============================================================================
// Arena
// =============================================================================

/// Bump allocator owned by one thread.
///
/// Memory from [`allocate`](Self::allocate) is freed with [`deallocate`],
/// from any thread, in any order, before or after the arena itself is gone.
pub struct Arena<'s> {
  space: &'s AddressSpace,
  cursor: Cursor,
}

impl<'s> Arena<'s> {
  /// Creates an arena that rents its first block on first use.
  pub const fn new(space: &'s AddressSpace) -> Self {
    Self {
      space,
      cursor: Cursor::new(),
    }
  }

  #[inline]
  pub fn space(&self) -> &'s AddressSpace {
    self.space
  }

  /// Block currently bumped from, if any.
  pub fn current_block(&self) -> Option<NonNull<u8>> {
    self.cursor.current.map(NonNull::cast)
  }

  /// Returns `size` bytes aligned to [`DEFAULT_ALIGN`].
  ///
  /// `size` must not exceed the configured `arena_max_request`.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    let config = self.space.config();
    let limit = config.arena_max_request;
    if size > limit {
      return Err(Error::TooLarge { bytes: size, limit });
    }

    let block_size = config.block_size;
    if let Some(ptr) = self.cursor.bump(size, block_size) {
      return Ok(ptr);
    }

    self.reset()?;
    self
      .cursor
      .bump(size, block_size)
      .ok_or(Error::TooLarge { bytes: size, limit })
  }

  /// Publishes the current block and moves to a fresh one.
  ///
  /// If renting fails the arena is left without a block.
  pub fn reset(&mut self) -> Result<()> {
    self.retire();
    let block = self.space.try_rent()?;
    self.cursor.claim(block);
    Ok(())
  }

  /// Publishes the current block without claiming a new one.
  pub fn retire(&mut self) {
    if let Some(block) = self.cursor.flush() {
      // Drained: no allocation from the block is live and the cursor left it.
      unsafe { self.space.release(block) };
    }
  }
}

impl Drop for Arena<'_> {
  fn drop(&mut self) {
    self.retire();
  }
}

/// Frees memory returned by [`Arena::allocate`] on any arena of `space`.
///
/// # Safety
///
/// `ptr` must come from an arena over `space` and must not have been freed.
pub unsafe fn deallocate(space: &AddressSpace, ptr: NonNull<u8>) {
  debug_assert!(space.contains(ptr.as_ptr()), "{ptr:p} is not arena memory");
  let block = space.block_of(ptr);
  let header = unsafe { block.cast::<ArenaHeader>().as_ref() };
  let prev = header.flying.fetch_sub(1, Ordering::SeqCst);
  if prev == 1 {
    unsafe { space.release(block) };
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static LOCAL: UnsafeCell<Arena<'static>> = UnsafeCell::new(Arena::new(AddressSpace::global()));
  static IN_ARENA: Cell<bool> = const { Cell::new(false) };
}

/// Marks this thread's arena as busy until dropped.
///
/// Allocations through [`with_local`] made while a guard is alive fall back to
/// the system heap. Guards nest: dropping an inner one keeps the outer state.
pub(crate) struct ReentryGuard {
  was_busy: bool,
}

impl ReentryGuard {
  pub(crate) fn enter() -> Self {
    let was_busy = IN_ARENA.try_with(|flag| flag.replace(true)).unwrap_or(true);
    Self { was_busy }
  }
}

impl Drop for ReentryGuard {
  fn drop(&mut self) {
    if !self.was_busy {
      let _ = IN_ARENA.try_with(|flag| flag.set(false));
    }
  }
}

/// Runs `f` on this thread's arena over the global address space.
///
/// Returns `None` when re-entered from inside `f` or once thread-local
/// storage is being torn down.
pub(crate) fn with_local<R>(f: impl FnOnce(&mut Arena<'static>) -> R) -> Option<R> {
  let guard = ReentryGuard::enter();
  if guard.was_busy {
    return None;
  }
  LOCAL.try_with(|cell| f(unsafe { &mut *cell.get() })).ok()
}
