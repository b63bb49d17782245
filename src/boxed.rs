//! Owning pointer into a [`MemoryResource`].

use core::{
  fmt,
  marker::PhantomData,
  mem::{self, align_of, size_of},
  ops::{Deref, DerefMut},
  ptr::{self, NonNull},
};

use crate::{MemoryResource, Result, arena_resource};

/// A single `T` stored in memory from a resource and freed back to it on drop.
///
/// With the arena resource the value lives in the allocating thread's arena
/// and may be dropped on any thread.
pub struct TempBox<'r, T> {
  resource: &'r dyn MemoryResource,
  ptr: NonNull<T>,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for TempBox<'_, T> {}
unsafe impl<T: Sync> Sync for TempBox<'_, T> {}

impl<T> TempBox<'static, T> {
  /// Moves `value` into the calling thread's arena.
  pub fn new(value: T) -> Result<Self> {
    Self::new_in(value, arena_resource())
  }
}

impl<'r, T> TempBox<'r, T> {
  pub fn new_in(value: T, resource: &'r dyn MemoryResource) -> Result<Self> {
    let ptr = resource.allocate(size_of::<T>(), align_of::<T>())?.cast::<T>();
    unsafe { ptr.write(value) };
    Ok(Self {
      resource,
      ptr,
      _marker: PhantomData,
    })
  }

  #[inline]
  pub fn resource(&self) -> &'r dyn MemoryResource {
    self.resource
  }

  /// Moves the value out and frees its memory.
  pub fn into_inner(self) -> T {
    let value = unsafe { self.ptr.read() };
    unsafe { self.free() };
    mem::forget(self);
    value
  }

  /// # Safety
  ///
  /// The value must already be moved out or dropped.
  unsafe fn free(&self) {
    unsafe {
      self
        .resource
        .deallocate(self.ptr.cast(), size_of::<T>(), align_of::<T>())
    };
  }
}

impl<T> Deref for TempBox<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { self.ptr.as_ref() }
  }
}

impl<T> DerefMut for TempBox<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { self.ptr.as_mut() }
  }
}

impl<T> Drop for TempBox<'_, T> {
  fn drop(&mut self) {
    unsafe {
      ptr::drop_in_place(self.ptr.as_ptr());
      self.free();
    }
  }
}

impl<T: fmt::Debug> fmt::Debug for TempBox<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&**self, f)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{AddressSpace, default_resource};
  use std::{rc::Rc, thread};

  #[test]
  fn value_lives_in_the_arena() {
    let mut boxed = TempBox::new([7u64; 4]).unwrap();
    assert!(AddressSpace::global().contains(ptr::from_ref(&*boxed).cast()));
    boxed[3] = 9;
    assert_eq!(*boxed, [7, 7, 7, 9]);
    assert!(boxed.resource().is_equal(arena_resource()));
  }

  #[test]
  fn into_inner_moves_out_without_dropping() {
    let token = Rc::new(());
    let boxed = TempBox::new(Rc::clone(&token)).unwrap();
    assert_eq!(Rc::strong_count(&token), 2);
    let inner = boxed.into_inner();
    assert_eq!(Rc::strong_count(&token), 2);
    drop(inner);
    assert_eq!(Rc::strong_count(&token), 1);
  }

  #[test]
  fn drop_runs_the_destructor() {
    let token = Rc::new(());
    drop(TempBox::new_in(Rc::clone(&token), default_resource()).unwrap());
    assert_eq!(Rc::strong_count(&token), 1);
  }

  #[test]
  fn overaligned_values_use_the_system_heap() {
    #[repr(align(64))]
    struct Line([u8; 64]);

    let boxed = TempBox::new(Line([3; 64])).unwrap();
    let addr = ptr::from_ref(&*boxed);
    assert_eq!(addr as usize % 64, 0);
    assert!(!AddressSpace::global().contains(addr.cast()));
    assert_eq!(boxed.0[63], 3);
  }

  #[test]
  fn dropped_on_another_thread() {
    let boxed = TempBox::new(String::from("handed off")).unwrap();
    let len = thread::spawn(move || boxed.len()).join().unwrap();
    assert_eq!(len, 10);
  }
}
