//! Reserved address space handing out fixed-size blocks.
//!
//! One contiguous range is reserved up front. Block ids below `brk` have been
//! handed out at least once; ids below `alloc` are backed by memory. Freed
//! blocks under the frontier are parked in a [`FreeBlockIndex`] and reused
//! lowest-address first, while frees at the frontier shrink it and eventually
//! decommit everything more than `hysteresis` blocks above it.

use core::{fmt, ptr::NonNull};
use std::{io, sync::OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{Config, Error, Result, arena::ReentryGuard, index::FreeBlockIndex, os};

// =============================================================================
// Types
// =============================================================================

/// Position of a block inside the reservation.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
  #[inline]
  pub const fn new(id: u32) -> Self {
    Self(id)
  }

  #[inline]
  pub const fn get(self) -> u32 {
    self.0
  }

  #[inline]
  pub(crate) const fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for BlockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Snapshot of the bookkeeping of an [`AddressSpace`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  /// One past the highest id in use (the frontier).
  pub brk: u32,
  /// Blocks currently backed by memory, `>= brk`.
  pub committed: u32,
  /// Committed free blocks below the frontier.
  pub holes: usize,
  /// Total successful rents.
  pub rented: u64,
  /// Total returns.
  pub returned: u64,
}

impl Stats {
  /// Blocks currently handed out.
  pub fn live(&self) -> usize {
    self.brk as usize - self.holes
  }

  /// Committed blocks above the frontier.
  pub fn slack(&self) -> u32 {
    self.committed - self.brk
  }
}

/// A block id picked under the lock.
struct Rented {
  id: BlockId,
  /// Whether the frontier grew into newly committed memory.
  committed: bool,
}

/// Decommit work done by a release, logged after the lock is dropped.
struct Shrink {
  from: u32,
  to: u32,
  brk: u32,
  failed: Option<(BlockId, io::Error)>,
}

struct State {
  brk: u32,
  alloc: u32,
  holes: FreeBlockIndex,
  rented: u64,
  returned: u64,
}

// =============================================================================
// AddressSpace
// =============================================================================

pub struct AddressSpace {
  /// Start of the mapping, as returned by the OS.
  base: NonNull<u8>,
  /// Bytes mapped at `base`. One block more than the reservation, for alignment.
  mapped: usize,
  /// First block-aligned address inside the mapping.
  start: usize,
  config: Config,
  state: Mutex<State>,
}

unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();
static GLOBAL: OnceLock<AddressSpace> = OnceLock::new();

impl AddressSpace {
  /// Reserves a new, private address space.
  pub fn new(config: Config) -> Result<Self> {
    config.validate()?;

    let mapped = config.reserved_size + config.block_size;
    let base = os::reserve(mapped).map_err(|source| Error::Reserve {
      size: mapped,
      source,
    })?;
    let start = align_up(base.as_ptr() as usize, config.block_size);

    debug!(
      start = format_args!("{start:#x}"),
      blocks = config.max_blocks(),
      block_size = config.block_size,
      "reserved address space"
    );

    Ok(Self {
      base,
      mapped,
      start,
      config,
      state: Mutex::new(State {
        brk: 0,
        alloc: 0,
        holes: FreeBlockIndex::with_capacity(config.max_blocks()),
        rented: 0,
        returned: 0,
      }),
    })
  }

  /// The process-wide address space, reserved on first use.
  ///
  /// Aborts the process if the reservation cannot be made.
  pub fn global() -> &'static Self {
    GLOBAL.get_or_init(|| {
      // The thread arena sits on this space and must not be entered mid-init.
      let _guard = ReentryGuard::enter();
      let config = *GLOBAL_CONFIG.get_or_init(Config::default);
      Self::new(config).unwrap_or_else(|err| fatal(&err))
    })
  }

  /// Sets the configuration of the global address space.
  ///
  /// Only succeeds before the global space is first used.
  pub fn configure_global(config: Config) -> Result<()> {
    config.validate()?;
    if GLOBAL.get().is_some() {
      return Err(Error::AlreadyInitialized);
    }
    GLOBAL_CONFIG
      .set(config)
      .map_err(|_| Error::AlreadyInitialized)
  }

  /// The global address space if something already touched it.
  pub(crate) fn try_global() -> Option<&'static Self> {
    GLOBAL.get()
  }

  #[inline]
  pub fn config(&self) -> &Config {
    &self.config
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    self.config.block_size
  }

  #[inline]
  pub fn max_blocks(&self) -> usize {
    self.config.max_blocks()
  }

  /// Whether `ptr` points into the reservation.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    addr >= self.start && addr < self.start + self.config.reserved_size
  }

  /// Start address of block `id`.
  #[inline]
  pub fn base_address(&self, id: BlockId) -> NonNull<u8> {
    debug_assert!(id.index() < self.max_blocks());
    let offset = self.start - self.base.as_ptr() as usize + id.index() * self.config.block_size;
    unsafe { self.base.add(offset) }
  }

  /// Id of the block starting at `block`.
  #[inline]
  pub fn block_id(&self, block: NonNull<u8>) -> BlockId {
    let addr = block.as_ptr() as usize;
    debug_assert!(self.contains(block.as_ptr()), "{block:p} is outside the reservation");
    debug_assert!(addr % self.config.block_size == 0, "{block:p} is not a block start");
    BlockId(((addr - self.start) / self.config.block_size) as u32)
  }

  /// Start of the block containing `ptr`.
  #[inline]
  pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> NonNull<u8> {
    let mask = self.config.block_size - 1;
    unsafe { NonNull::new_unchecked(ptr.as_ptr().map_addr(|addr| addr & !mask)) }
  }

  pub fn stats(&self) -> Stats {
    let state = self.state.lock();
    Stats {
      brk: state.brk,
      committed: state.alloc,
      holes: state.holes.len(),
      rented: state.rented,
      returned: state.returned,
    }
  }

  // ===========================================================================
  // Rent / Return
  // ===========================================================================

  /// Hands out a committed block, preferring the lowest free one over growth.
  pub fn try_rent(&self) -> Result<NonNull<u8>> {
    // Anything allocated from here on, the log events included, skips this
    // thread's arena: it could need a block and the lock is not reentrant.
    let _guard = ReentryGuard::enter();

    let mut state = self.state.lock();
    let rented = self.alloc_id(&mut state);
    if rented.is_ok() {
      state.rented += 1;
    }
    drop(state);

    match rented {
      Ok(Rented { id, committed }) => {
        if committed {
          trace!(block = %id, "committed block");
        }
        Ok(self.base_address(id))
      }
      Err(err) => {
        error!(%err, "cannot rent block");
        Err(err)
      }
    }
  }

  /// Like [`try_rent`](Self::try_rent), but aborts the process on failure.
  pub fn rent(&self) -> NonNull<u8> {
    self.try_rent().unwrap_or_else(|err| fatal(&err))
  }

  /// Takes back a block from [`rent`](Self::rent).
  ///
  /// ```compile_fail,E0133
  /// use blockarena::{AddressSpace, Config};
  ///
  /// let space = AddressSpace::new(Config::default()).unwrap();
  /// let block = space.rent();
  /// space.release(block);
  /// ```
  ///
  /// # Safety
  ///
  /// `block` must be a block start rented from this space and not returned
  /// since. Nothing may access the block afterwards: it can be handed out
  /// again or decommitted at any time.
  pub unsafe fn release(&self, block: NonNull<u8>) {
    let id = self.block_id(block);
    let _guard = ReentryGuard::enter();

    let mut state = self.state.lock();
    let shrink = self.release_id(&mut state, id);
    state.returned += 1;
    drop(state);

    let Some(shrink) = shrink else {
      return;
    };
    if let Some((block, err)) = &shrink.failed {
      warn!(block = %block, error = %err, "decommit failed, block stays committed");
    }
    debug!(
      from = shrink.from,
      to = shrink.to,
      brk = shrink.brk,
      "decommitted blocks"
    );
  }

  fn alloc_id(&self, state: &mut State) -> Result<Rented> {
    if let Some(id) = state.holes.pop_front() {
      return Ok(Rented {
        id,
        committed: false,
      });
    }

    let mut committed = false;
    if state.brk == state.alloc {
      let next = BlockId(state.alloc);
      if next.index() >= self.max_blocks() {
        return Err(Error::Exhausted {
          capacity: self.max_blocks(),
        });
      }

      unsafe { os::commit(self.base_address(next), self.config.block_size) }
        .map_err(|source| Error::Commit {
          block: next,
          source,
        })?;
      state.alloc += 1;
      committed = true;
    }

    let id = BlockId(state.brk);
    state.brk += 1;
    Ok(Rented { id, committed })
  }

  fn release_id(&self, state: &mut State, id: BlockId) -> Option<Shrink> {
    debug_assert!(id.0 < state.brk, "block {id} was never rented");
    debug_assert!(!state.holes.contains(id), "block {id} returned twice");

    if id.0 + 1 != state.brk {
      state.holes.push(id);
      return None;
    }

    // Pull the frontier down over any run of free blocks below it.
    state.brk -= 1;
    while state.brk > 0 && state.holes.pop_back_if(BlockId(state.brk - 1)) {
      state.brk -= 1;
    }

    if state.alloc <= state.brk + self.config.hysteresis {
      return None;
    }

    let from = state.alloc;
    let mut failed = None;
    while state.alloc > state.brk {
      let victim = BlockId(state.alloc - 1);
      if let Err(err) = unsafe { os::decommit(self.base_address(victim), self.config.block_size) } {
        failed = Some((victim, err));
        break;
      }
      state.alloc -= 1;
    }
    Some(Shrink {
      from,
      to: state.alloc,
      brk: state.brk,
      failed,
    })
  }
}

impl Drop for AddressSpace {
  fn drop(&mut self) {
    unsafe { os::unreserve(self.base, self.mapped) };
  }
}

impl fmt::Debug for AddressSpace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AddressSpace")
      .field("start", &format_args!("{:#x}", self.start))
      .field("config", &self.config)
      .field("stats", &self.stats())
      .finish()
  }
}

/// Logs `err` and aborts. Used where the contract leaves no way to report failure.
#[cold]
pub(crate) fn fatal(err: &Error) -> ! {
  error!(%err, "fatal allocator error");
  eprintln!("blockarena: fatal: {err}");
  std::process::abort()
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use std::collections::BTreeSet;

  const SMALL_BLOCK: usize = 1 << 16;

  fn small(blocks: usize) -> AddressSpace {
    let config = Config::default()
      .with_block_size(SMALL_BLOCK)
      .with_max_blocks(blocks)
      .with_arena_max_request(1 << 12);
    AddressSpace::new(config).unwrap()
  }

  fn ids(space: &AddressSpace, blocks: &[NonNull<u8>]) -> Vec<u32> {
    blocks.iter().map(|&b| space.block_id(b).get()).collect()
  }

  #[test]
  fn blocks_are_aligned_and_writable() {
    let space = small(8);
    let a = space.rent();
    let b = space.rent();
    assert_eq!(a.as_ptr() as usize % SMALL_BLOCK, 0);
    assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, SMALL_BLOCK);
    unsafe {
      a.as_ptr().write_bytes(0xAB, SMALL_BLOCK);
      b.as_ptr().write_bytes(0xCD, SMALL_BLOCK);
      assert_eq!(*a.as_ptr().add(SMALL_BLOCK - 1), 0xAB);
    }
    assert_eq!(space.stats().brk, 2);
    assert_eq!(space.stats().committed, 2);
  }

  #[test]
  fn reuses_lowest_hole_before_growing() {
    let space = small(16);
    let blocks: Vec<_> = (0..6).map(|_| space.rent()).collect();
    unsafe { space.release(blocks[4]) };
    unsafe { space.release(blocks[1]) };
    unsafe { space.release(blocks[2]) };
    assert_eq!(space.stats().holes, 3);

    let again = space.rent();
    assert_eq!(again, blocks[1]);
    let again = space.rent();
    assert_eq!(again, blocks[2]);
    assert_eq!(space.stats().brk, 6);
  }

  #[test]
  fn frontier_coalesces_trailing_holes() {
    let space = small(16);
    let blocks: Vec<_> = (0..5).map(|_| space.rent()).collect();

    unsafe { space.release(blocks[4]) };
    unsafe { space.release(blocks[3]) };
    unsafe { space.release(blocks[2]) };
    let stats = space.stats();
    assert_eq!(stats.brk, 2);
    assert_eq!(stats.holes, 0);

    // Holes below the top are swallowed once the top block goes.
    let blocks: Vec<_> = (0..3).map(|_| space.rent()).collect();
    assert_eq!(ids(&space, &blocks), vec![2, 3, 4]);
    unsafe { space.release(blocks[0]) };
    unsafe { space.release(blocks[1]) };
    assert_eq!(space.stats().holes, 2);
    unsafe { space.release(blocks[2]) };
    let stats = space.stats();
    assert_eq!(stats.brk, 2);
    assert_eq!(stats.holes, 0);
  }

  #[test]
  fn decommits_beyond_hysteresis() {
    let space = small(16);
    let blocks: Vec<_> = (0..10).map(|_| space.rent()).collect();
    assert_eq!(space.stats().committed, 10);

    // Slack up to the margin is kept.
    for &b in blocks[5..].iter().rev() {
      unsafe { space.release(b) };
    }
    assert_eq!(space.stats().brk, 5);
    assert_eq!(space.stats().committed, 10);

    unsafe { space.release(blocks[4]) };
    let stats = space.stats();
    assert_eq!(stats.brk, 4);
    assert_eq!(stats.committed, 4);

    // Regrowing recommits.
    let again: Vec<_> = (0..3).map(|_| space.rent()).collect();
    assert_eq!(ids(&space, &again), vec![4, 5, 6]);
    unsafe { again[2].as_ptr().write(1) };
    assert_eq!(space.stats().committed, 7);
  }

  #[test]
  fn exhaustion_is_reported() {
    let space = small(3);
    let blocks: Vec<_> = (0..3).map(|_| space.try_rent().unwrap()).collect();
    let err = space.try_rent().unwrap_err();
    assert!(matches!(err, Error::Exhausted { capacity: 3 }));

    unsafe { space.release(blocks[1]) };
    assert_eq!(space.try_rent().unwrap(), blocks[1]);
  }

  #[test]
  fn containment_and_masking() {
    let space = small(4);
    let block = space.rent();
    let inner = unsafe { block.add(1234) };
    assert!(space.contains(inner.as_ptr()));
    assert_eq!(space.block_of(inner), block);
    assert!(!space.contains(core::ptr::null()));
    let end = unsafe { space.base_address(BlockId(3)).add(SMALL_BLOCK) };
    assert!(!space.contains(end.as_ptr()));
  }

  #[derive(Debug, Clone)]
  enum Op {
    Rent,
    Return(usize),
  }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      3 => Just(Op::Rent),
      2 => any::<usize>().prop_map(Op::Return),
    ]
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rent_return_sequences_keep_invariants(ops in prop::collection::vec(op(), 1..200)) {
      let space = small(32);
      let mut live: Vec<NonNull<u8>> = Vec::new();
      let mut holes: BTreeSet<u32> = BTreeSet::new();

      for op in ops {
        match op {
          Op::Rent => {
            let expected_hole = holes.pop_first();
            let Ok(block) = space.try_rent() else {
              prop_assert_eq!(live.len(), 32);
              continue;
            };
            let id = space.block_id(block).get();
            if let Some(hole) = expected_hole {
              prop_assert_eq!(id, hole);
            }
            prop_assert_eq!(block.as_ptr() as usize % SMALL_BLOCK, 0);
            prop_assert!(!live.contains(&block));
            live.push(block);
          }
          Op::Return(pick) => {
            if live.is_empty() {
              continue;
            }
            let block = live.swap_remove(pick % live.len());
            unsafe { space.release(block) };
            // Rebuild the hole model from the frontier.
            let brk = space.stats().brk;
            holes = (0..brk)
              .filter(|id| !live.iter().any(|&b| space.block_id(b).get() == *id))
              .collect();
          }
        }

        let stats = space.stats();
        prop_assert!(stats.committed >= stats.brk);
        prop_assert!(stats.slack() <= 5);
        prop_assert_eq!(stats.live(), live.len());
        prop_assert_eq!(stats.holes, holes.len());
      }
    }
  }
}
