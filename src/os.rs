use core::ptr::{NonNull, null_mut};
use std::{io, sync::OnceLock};

#[cfg(not(unix))]
compile_error!("blockarena needs mmap/mprotect/madvise and only supports unix targets");

// =============================================================================
// Platform
// =============================================================================

pub(crate) fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size < 1 { 4096 } else { size as usize }
  })
}

/// Reserves `size` bytes of address space with no access and no backing memory.
pub(crate) fn reserve(size: usize) -> io::Result<NonNull<u8>> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(io::Error::last_os_error());
  }
  NonNull::new(ptr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
}

/// Releases a reservation made by [`reserve`].
pub(crate) unsafe fn unreserve(ptr: NonNull<u8>, size: usize) {
  unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
}

/// Makes `[ptr, ptr + size)` readable and writable.
pub(crate) unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
  let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE) };
  if rc == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Drops the physical pages behind `[ptr, ptr + size)` and revokes access.
///
/// On error the range must be treated as still committed.
pub(crate) unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
  let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) };
  if rc == -1 {
    return Err(io::Error::last_os_error());
  }
  let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), size, libc::PROT_NONE) };
  if rc == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}
