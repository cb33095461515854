/// Anonymous shared memory mappings
///
/// `MAP_SHARED | MAP_ANONYMOUS` pages survive `fork()` as the same physical
/// memory, which is what lets forked engine processes bump a counter the
/// supervisor can read, and what gives memthrash workers one region to fight over.
use crate::config::types::{Result, StressError};
use std::ptr::NonNull;

/// One `MAP_SHARED | MAP_ANONYMOUS` mapping, unmapped exactly once on drop.
#[derive(Debug)]
pub struct SharedMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory with no thread affinity. Callers decide
// how concurrent access is coordinated (atomics for counters, nothing for the
// thrash region).
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Map `len` bytes of zeroed, read-write shared memory.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(StressError::Config("cannot map zero bytes".to_string()));
        }

        // SAFETY: anonymous mapping with no address hint and no backing fd.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return Err(StressError::Resource(format!("mmap of {} bytes: {}", len, err)));
        }

        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| StressError::Resource("mmap returned a null mapping".to_string()))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a live mapping created in new(); drop runs once.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc < 0 {
            log::warn!(
                "munmap of {} bytes failed: {}",
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// System page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
