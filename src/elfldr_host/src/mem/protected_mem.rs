/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::ffi::c_void;
use std::io::Error;
use std::mem::ManuallyDrop;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::null_mut;

use libc::{
    c_int, ftruncate, memfd_create, mmap, mprotect, munmap, off_t, size_t, MAP_ANONYMOUS,
    MAP_FAILED, MAP_PRIVATE, MAP_SHARED, MFD_CLOEXEC, PROT_EXEC, PROT_READ, PROT_WRITE,
};
use tracing::{instrument, Span};

use crate::config::MemoryMode;
use crate::error::LoaderError::{
    AllocationFailure, MemoryReleased, MemoryRequestTooBig, ReleaseFailure,
};
use crate::{new_error, Result};

fn last_errno() -> Option<i32> {
    Error::last_os_error().raw_os_error()
}

/// Returns the host page size
pub fn page_size() -> usize {
    // sysconf(_SC_PAGESIZE) does not fail on Linux
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// A single host mapping, unmapped when dropped. Not Clone, since it
/// holds ownership of the mapping.
#[derive(Debug)]
struct HostMapping {
    ptr: *mut u8,
    size: usize,
}

impl HostMapping {
    fn new(size: usize, prot: c_int, flags: c_int, fd: RawFd) -> Result<Self> {
        let addr = unsafe { mmap(null_mut(), size as size_t, prot, flags, fd, 0 as off_t) };
        if addr == MAP_FAILED {
            return Err(AllocationFailure {
                op: "mmap",
                errno: last_errno(),
            });
        }
        Ok(Self {
            ptr: addr as *mut u8,
            size,
        })
    }

    fn protect(&self, prot: c_int) -> Result<()> {
        let res = unsafe { mprotect(self.ptr as *mut c_void, self.size, prot) };
        if res != 0 {
            return Err(AllocationFailure {
                op: "mprotect",
                errno: last_errno(),
            });
        }
        Ok(())
    }

    /// Unmap now and report the outcome instead of leaving it to `Drop`
    fn unmap(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        let res = unsafe { munmap(this.ptr as *mut c_void, this.size) };
        if res != 0 {
            return Err(ReleaseFailure(last_errno()));
        }
        Ok(())
    }
}

impl Drop for HostMapping {
    fn drop(&mut self) {
        if unsafe { munmap(self.ptr as *mut c_void, self.size) } != 0 {
            log::error!(
                "Failed to drop HostMapping at {:p} (munmap failed): {:?}",
                self.ptr,
                last_errno()
            );
        }
    }
}

/// The mappings that back one region
#[derive(Debug)]
enum Backing {
    /// Two views of one memfd object. `writable` is RW-, `executable` is R-X.
    Direct {
        writable: HostMapping,
        executable: HostMapping,
    },
    /// One RWX mapping serving as both views
    Emulated(HostMapping),
}

impl Backing {
    fn writable(&self) -> &HostMapping {
        match self {
            Backing::Direct { writable, .. } => writable,
            Backing::Emulated(mapping) => mapping,
        }
    }

    fn executable(&self) -> &HostMapping {
        match self {
            Backing::Direct { executable, .. } => executable,
            Backing::Emulated(mapping) => mapping,
        }
    }

    fn release(self) -> Result<()> {
        match self {
            Backing::Direct {
                writable,
                executable,
            } => {
                // both views must be attempted even if the first one fails
                let w = writable.unmap();
                let x = executable.unmap();
                w.and(x)
            }
            Backing::Emulated(mapping) => mapping.unmap(),
        }
    }
}

/// One allocation backing one loaded payload, with a writable view used
/// while loading and an executable view used from the moment the payload
/// starts running.
///
/// The region is released exactly once: either by an explicit call to
/// `destroy`, or when the value is dropped. A `ProtectedMemory` can be moved
/// to another thread but is not `Sync`, so a region is never operated on by
/// two threads at once.
#[derive(Debug)]
pub struct ProtectedMemory {
    backing: Option<Backing>,
    size: usize,
    mode: MemoryMode,
}

// The raw pointers inside are owned exclusively by this value; moving it
// moves that ownership.
unsafe impl Send for ProtectedMemory {}

impl ProtectedMemory {
    /// Create a new region of at least `min_size_bytes`, rounded up to the
    /// host page size, using the given backing strategy. A new region reads
    /// as all zero.
    ///
    /// Return `Err` if the memory or its views could not be set up. Any
    /// partially created mapping is released before returning.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(min_size_bytes: usize, mode: MemoryMode) -> Result<Self> {
        if min_size_bytes == 0 {
            return Err(new_error!("Cannot create protected memory with size 0"));
        }

        let total_size = min_size_bytes
            .checked_next_multiple_of(page_size())
            .ok_or_else(|| new_error!("Memory required for payload exceeded usize::MAX"))?;

        // usize and isize are guaranteed to be the same size, and
        // isize::MAX should be positive, so this cast should be safe.
        if total_size > isize::MAX as usize {
            return Err(MemoryRequestTooBig(total_size, isize::MAX as usize));
        }

        let backing = match mode {
            MemoryMode::Direct => Self::create_direct(total_size)?,
            MemoryMode::Emulated => Self::create_emulated(total_size)?,
        };

        log::debug!(
            "protected memory of {:#x} bytes ({:?}): writable {:p}, executable {:p}",
            total_size,
            mode,
            backing.writable().ptr,
            backing.executable().ptr
        );

        Ok(Self {
            backing: Some(backing),
            size: total_size,
            mode,
        })
    }

    fn create_direct(size: usize) -> Result<Backing> {
        let raw = unsafe { memfd_create(c"elfldr-payload".as_ptr(), MFD_CLOEXEC) };
        if raw < 0 {
            return Err(AllocationFailure {
                op: "memfd_create",
                errno: last_errno(),
            });
        }
        // the mappings keep the object alive, so the descriptor itself is
        // closed as soon as both views exist (or on any early return)
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { ftruncate(fd.as_raw_fd(), size as off_t) } != 0 {
            return Err(AllocationFailure {
                op: "ftruncate",
                errno: last_errno(),
            });
        }

        let writable = HostMapping::new(size, PROT_READ | PROT_WRITE, MAP_SHARED, fd.as_raw_fd())?;
        let executable = HostMapping::new(size, PROT_READ | PROT_EXEC, MAP_SHARED, fd.as_raw_fd())?;

        Ok(Backing::Direct {
            writable,
            executable,
        })
    }

    fn create_emulated(size: usize) -> Result<Backing> {
        let mapping = HostMapping::new(
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1 as c_int,
        )?;
        mapping.protect(PROT_READ | PROT_WRITE | PROT_EXEC)?;
        Ok(Backing::Emulated(mapping))
    }

    fn backing(&self) -> Result<&Backing> {
        self.backing.as_ref().ok_or(MemoryReleased)
    }

    /// The usable size of the region in bytes (a multiple of the page size)
    pub fn size(&self) -> usize {
        self.size
    }

    /// The strategy backing this region
    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    /// Whether `destroy` has already run
    pub fn is_released(&self) -> bool {
        self.backing.is_none()
    }

    /// The writable view as a slice. Only meaningful while loading.
    ///
    /// The slice borrows `self` mutably, so no other access to the region
    /// can happen through safe code while it is alive.
    pub fn writable_view(&mut self) -> Result<&mut [u8]> {
        let mapping = self.backing()?.writable();
        // SAFETY: the mapping is readable and writable for `size` bytes,
        // zero-initialised by the kernel, and lives as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(mapping.ptr, mapping.size) })
    }

    /// The base address of the writable view
    pub fn writable_base(&self) -> Result<*mut u8> {
        Ok(self.backing()?.writable().ptr)
    }

    /// The base address of the executable view. Following the general Rust
    /// philosophy, this does not need to be marked as `unsafe` because doing
    /// anything with this pointer itself requires `unsafe`.
    pub fn executable_base(&self) -> Result<*const u8> {
        Ok(self.backing()?.executable().ptr as *const u8)
    }

    /// Make writes done through the writable view to `[offset, offset + len)`
    /// visible to instruction fetches from the executable view. Only the
    /// given range is touched, so pages outside it stay uncommitted.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn sync_instruction_cache(&self, offset: usize, len: usize) -> Result<()> {
        let backing = self.backing()?;
        match offset.checked_add(len) {
            Some(end) if end <= self.size => {}
            _ => {
                return Err(new_error!(
                    "cache sync of {:#x}+{:#x} is outside a region of {:#x} bytes",
                    offset,
                    len,
                    self.size
                ));
            }
        }
        #[cfg(target_arch = "aarch64")]
        {
            extern "C" {
                fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
            }
            for mapping in [backing.writable(), backing.executable()] {
                // SAFETY: the range was checked against the live mapping above
                unsafe {
                    let begin = (mapping.ptr as *mut libc::c_char).add(offset);
                    __clear_cache(begin, begin.add(len));
                }
            }
        }
        #[cfg(not(target_arch = "aarch64"))]
        let _ = backing;
        Ok(())
    }

    /// Release the backing memory.
    ///
    /// Calling this more than once is a no-op. If unmapping fails the
    /// region is still considered released and the error is returned so the
    /// caller can log it.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn destroy(&mut self) -> Result<()> {
        match self.backing.take() {
            Some(backing) => {
                log::debug!(
                    "releasing protected memory at {:p} ({:#x} bytes)",
                    backing.writable().ptr,
                    self.size
                );
                backing.release()
            }
            None => {
                log::debug!("protected memory already released, nothing to do");
                Ok(())
            }
        }
    }
}

impl Drop for ProtectedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::error!("Memory could not be completely freed: {}", e);
        }
    }
}
