//! FIFO queue of fixed-size chunks drawn from a [`MemoryResource`].

use core::{
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::NonNull,
};

use crate::{MemoryResource, Result, arena_resource, space::align_up};

/// Target chunk footprint, link included.
const CHUNK_BYTES: usize = 4096;

struct Link {
  next: Option<NonNull<Link>>,
}

/// Single-owner FIFO queue.
///
/// Chunks come from the resource one at a time and go back as soon as the
/// read cursor leaves them, so with the arena resource a drained queue keeps
/// no block alive.
pub struct TempQueue<'r, T> {
  resource: &'r dyn MemoryResource,
  head: Option<NonNull<Link>>,
  tail: Option<NonNull<Link>>,
  read: usize,
  write: usize,
  len: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for TempQueue<'_, T> {}

impl<T> TempQueue<'static, T> {
  /// A queue over the thread-local arenas.
  pub fn new() -> Self {
    Self::new_in(arena_resource())
  }
}

impl<T> Default for TempQueue<'static, T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<'r, T> TempQueue<'r, T> {
  const SLOTS: usize = {
    let fit = (CHUNK_BYTES - size_of::<Link>()) / size_of::<T>();
    if fit == 0 { 1 } else { fit }
  };
  /// Offset of the first slot.
  const OFFSET: usize = align_up(size_of::<Link>(), align_of::<T>());
  const CHUNK_SIZE: usize = Self::OFFSET + Self::SLOTS * size_of::<T>();
  const CHUNK_ALIGN: usize = if align_of::<T>() > align_of::<Link>() {
    align_of::<T>()
  } else {
    align_of::<Link>()
  };

  pub fn new_in(resource: &'r dyn MemoryResource) -> Self {
    const { assert!(size_of::<T>() != 0, "zero-sized elements are not supported") };
    Self {
      resource,
      head: None,
      tail: None,
      read: 0,
      write: 0,
      len: 0,
      _marker: PhantomData,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  fn slot(chunk: NonNull<Link>, index: usize) -> *mut T {
    unsafe { chunk.cast::<u8>().add(Self::OFFSET).cast::<T>().as_ptr().add(index) }
  }

  fn alloc_chunk(&self) -> Result<NonNull<Link>> {
    let chunk = self
      .resource
      .allocate(Self::CHUNK_SIZE, Self::CHUNK_ALIGN)?
      .cast::<Link>();
    unsafe { chunk.write(Link { next: None }) };
    Ok(chunk)
  }

  fn free_chunk(&self, chunk: NonNull<Link>) {
    unsafe {
      self
        .resource
        .deallocate(chunk.cast(), Self::CHUNK_SIZE, Self::CHUNK_ALIGN)
    };
  }

  pub fn push(&mut self, value: T) -> Result<()> {
    let tail = match self.tail {
      Some(tail) if self.write < Self::SLOTS => tail,
      Some(tail) => {
        let chunk = self.alloc_chunk()?;
        unsafe { (*tail.as_ptr()).next = Some(chunk) };
        self.tail = Some(chunk);
        self.write = 0;
        chunk
      }
      None => {
        let chunk = self.alloc_chunk()?;
        self.head = Some(chunk);
        self.tail = Some(chunk);
        self.read = 0;
        self.write = 0;
        chunk
      }
    };

    unsafe { Self::slot(tail, self.write).write(value) };
    self.write += 1;
    self.len += 1;
    Ok(())
  }

  pub fn pop(&mut self) -> Option<T> {
    if self.len == 0 {
      return None;
    }
    let head = self.head?;
    let value = unsafe { Self::slot(head, self.read).read() };
    self.read += 1;
    self.len -= 1;

    if self.len == 0 {
      self.free_chunk(head);
      self.head = None;
      self.tail = None;
      self.read = 0;
      self.write = 0;
    } else if self.read == Self::SLOTS {
      self.head = unsafe { (*head.as_ptr()).next };
      self.read = 0;
      self.free_chunk(head);
    }
    Some(value)
  }
}

impl<T> Drop for TempQueue<'_, T> {
  fn drop(&mut self) {
    while self.pop().is_some() {}
  }
}

impl<T> Extend<T> for TempQueue<'_, T> {
  /// Panics if the resource runs out of memory.
  fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
    for value in iter {
      if let Err(err) = self.push(value) {
        panic!("TempQueue::extend: {err}");
      }
    }
  }
}
