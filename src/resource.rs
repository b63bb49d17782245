use core::{
  alloc::{GlobalAlloc, Layout},
  any::type_name,
  ptr::{self, NonNull, null_mut},
};
use std::alloc::System;

use crate::{AddressSpace, DEFAULT_ALIGN, Error, Result, arena, space::align_up};

// =============================================================================
// MemoryResource
// =============================================================================

/// Pluggable allocate/deallocate capability.
pub trait MemoryResource: Send + Sync {
  fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>>;

  /// # Safety
  ///
  /// `ptr` must come from `allocate` on a resource equal to this one, with the
  /// same `bytes` and `align`, and must not have been freed.
  unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize);

  /// Whether memory from `self` can be freed through `other` and vice versa.
  ///
  /// Defaults to identity.
  fn is_equal(&self, other: &dyn MemoryResource) -> bool {
    ptr::addr_eq(self, other) && self.name() == other.name()
  }

  fn name(&self) -> &'static str {
    type_name::<Self>()
  }
}

impl PartialEq for dyn MemoryResource + '_ {
  fn eq(&self, other: &Self) -> bool {
    self.is_equal(other)
  }
}

impl core::fmt::Debug for dyn MemoryResource + '_ {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.write_str(self.name())
  }
}

// =============================================================================
// System heap
// =============================================================================

/// The process heap, without any arena in between.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResource;

impl MemoryResource for SystemResource {
  fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
    let layout =
      Layout::from_size_align(bytes.max(1), align).map_err(|_| Error::Layout { bytes, align })?;
    let ptr = unsafe { System.alloc(layout) };
    NonNull::new(ptr).ok_or(Error::OutOfMemory { bytes, align })
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(bytes.max(1), align) };
    unsafe { System.dealloc(ptr.as_ptr(), layout) };
  }
}

// =============================================================================
// Arena
// =============================================================================

/// Thread-local arenas over the global address space.
///
/// Requests above `arena_max_request` or aligned beyond [`DEFAULT_ALIGN`] go
/// to the system heap, as does anything allocated while the calling thread's
/// arena is busy or already torn down. Frees are routed by address.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArenaResource;

impl MemoryResource for ArenaResource {
  fn allocate(&self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
    if align <= DEFAULT_ALIGN {
      let served = arena::with_local(|arena| {
        (bytes <= arena.space().config().arena_max_request).then(|| arena.allocate(bytes))
      });
      if let Some(Some(result)) = served {
        return result;
      }
    }
    SystemResource.allocate(bytes, align)
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize, align: usize) {
    if let Some(space) = AddressSpace::try_global()
      && space.contains(ptr.as_ptr())
    {
      debug_assert!(align <= DEFAULT_ALIGN);
      unsafe { arena::deallocate(space, ptr) };
      return;
    }
    unsafe { SystemResource.deallocate(ptr, bytes, align) };
  }
}

pub(crate) static SYSTEM_RESOURCE: SystemResource = SystemResource;
pub(crate) static ARENA_RESOURCE: ArenaResource = ArenaResource;

// =============================================================================
// GlobalAlloc
// =============================================================================

/// [`GlobalAlloc`] over [`ArenaResource`].
///
/// Suitable for `#[global_allocator]`: allocations made while the arena is
/// being set up fall through to the system heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct TempAlloc;

unsafe impl GlobalAlloc for TempAlloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    ARENA_RESOURCE
      .allocate(layout.size(), layout.align())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { ARENA_RESOURCE.deallocate(ptr, layout.size(), layout.align()) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let old_size = layout.size();

    // Arena slots are rounded up, so shrinking or growing within the slot is free.
    if let Some(space) = AddressSpace::try_global()
      && space.contains(ptr)
      && new_size <= align_up(old_size.max(1), DEFAULT_ALIGN)
    {
      return ptr;
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }
    new_ptr
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{arena_resource, default_resource};

  #[test]
  fn identity_equality() {
    assert!(arena_resource().is_equal(arena_resource()));
    assert!(default_resource().is_equal(default_resource()));
    assert!(!arena_resource().is_equal(default_resource()));
    assert!(*arena_resource() != *default_resource());

    let local = SystemResource;
    assert!(local.is_equal(&local));
  }

  #[test]
  fn system_resource_honours_alignment() {
    let ptr = SYSTEM_RESOURCE.allocate(100, 256).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 256, 0);
    unsafe { SYSTEM_RESOURCE.deallocate(ptr, 100, 256) };
  }

  #[test]
  fn system_resource_rejects_bad_alignment() {
    let err = SYSTEM_RESOURCE.allocate(8, 3).unwrap_err();
    assert!(matches!(err, Error::Layout { bytes: 8, align: 3 }));
  }

  #[test]
  fn temp_alloc_realloc_keeps_slot() {
    let alloc = TempAlloc;
    unsafe {
      let layout = Layout::from_size_align(20, 8).unwrap();
      let ptr = alloc.alloc(layout);
      assert!(!ptr.is_null());
      ptr.write_bytes(7, 20);

      let same = alloc.realloc(ptr, layout, 32);
      assert_eq!(same, ptr);

      let grown = alloc.realloc(same, Layout::from_size_align(32, 8).unwrap(), 1000);
      assert!(!grown.is_null());
      assert_eq!(*grown.add(19), 7);
      alloc.dealloc(grown, Layout::from_size_align(1000, 8).unwrap());
    }
  }
}
