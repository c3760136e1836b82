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

use std::ffi::{c_char, c_int};
use std::ptr::null;

use tracing::{instrument, Span};

use crate::error::LoaderError::EntryOutOfBounds;
use crate::mem::protected_mem::ProtectedMemory;
use crate::mem::ptr_offset::Offset;
use crate::Result;

/// Payloads are entered like a C `main`
type EntryFn = unsafe extern "C" fn(c_int, *const *const c_char) -> c_int;

/// The name passed to every payload as `argv[0]`
const PAYLOAD_ARGV0: &std::ffi::CStr = c"elf";

/// The address a payload starts executing at, inside the executable view of
/// its region
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint {
    addr: *const u8,
}

impl EntryPoint {
    /// Resolve `offset` against the executable view of `region`
    pub fn new(region: &ProtectedMemory, offset: Offset) -> Result<Self> {
        let off = usize::try_from(offset)?;
        if off >= region.size() {
            return Err(EntryOutOfBounds(offset.into(), region.size()));
        }
        let base = region.executable_base()?;
        Ok(Self {
            addr: base.wrapping_add(off),
        })
    }

    /// The absolute entry address
    pub fn address(&self) -> *const u8 {
        self.addr
    }

    /// Call the payload as `main(1, {"elf", NULL})` and return its result.
    ///
    /// # Safety
    ///
    /// The region this entry point was resolved against must still be live
    /// and hold a fully loaded image whose entry follows the C calling
    /// convention for this host. The payload runs with the full privileges
    /// of this process, so nothing it does can be contained here.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub unsafe fn invoke(&self) -> i32 {
        let argv: [*const c_char; 2] = [PAYLOAD_ARGV0.as_ptr(), null()];
        log::debug!("entering payload at {:p}", self.addr);
        // SAFETY: upheld by the caller
        let entry = unsafe { std::mem::transmute::<*const u8, EntryFn>(self.addr) };
        let ret = unsafe { entry(1, argv.as_ptr()) };
        log::debug!("payload at {:p} returned {}", self.addr, ret);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::EntryPoint;
    use crate::config::MemoryMode;
    use crate::error::LoaderError;
    use crate::mem::protected_mem::ProtectedMemory;
    use crate::mem::ptr_offset::Offset;
    use crate::Result;

    #[test]
    fn entry_must_lie_inside_region() -> Result<()> {
        let region = ProtectedMemory::new(64, MemoryMode::Direct)?;
        let size = region.size() as u64;

        let entry = EntryPoint::new(&region, Offset::from(size - 1))?;
        assert_eq!(
            entry.address() as usize,
            region.executable_base()? as usize + size as usize - 1
        );
        assert!(matches!(
            EntryPoint::new(&region, Offset::from(size)),
            Err(LoaderError::EntryOutOfBounds(_, _))
        ));
        Ok(())
    }

    #[test]
    fn entry_needs_live_region() -> Result<()> {
        let mut region = ProtectedMemory::new(64, MemoryMode::Emulated)?;
        region.destroy()?;
        assert!(matches!(
            EntryPoint::new(&region, Offset::from(0)),
            Err(LoaderError::MemoryReleased)
        ));
        Ok(())
    }
}
