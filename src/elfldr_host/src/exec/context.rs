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

use tracing::{instrument, Span};

use super::entry::EntryPoint;
use crate::config::MemoryMode;
use crate::mem::elf::ElfImage;
use crate::mem::protected_mem::ProtectedMemory;
use crate::Result;

/// A loaded payload together with the region backing it.
///
/// The value is created once the image has been copied into its region and
/// is consumed by `run`, which releases the region as soon as the payload
/// returns. A payload that is never run releases its region on drop, so the
/// memory is freed exactly once on every path, including a thread that
/// fails to start.
#[derive(Debug)]
pub struct PayloadExecution {
    id: u64,
    region: ProtectedMemory,
    entry: EntryPoint,
}

// The entry point only refers into `region`, which this value owns, and the
// whole bundle is handed to exactly one thread.
unsafe impl Send for PayloadExecution {}

impl PayloadExecution {
    /// Allocate a region sized for `image`, copy the image into it and
    /// resolve its entry point. The image's source bytes are released
    /// whether or not loading succeeds, and so is any region already
    /// allocated when a later step fails.
    #[instrument(err(Debug), skip(image), parent = Span::current(), level= "Trace")]
    pub fn load(id: u64, image: ElfImage, mode: MemoryMode) -> Result<Self> {
        let loaded = Self::load_image(&image, mode);
        image.release();
        let (region, entry) = loaded?;
        log::debug!(
            "payload {} loaded at {:p}, entry {:p}",
            id,
            region.executable_base()?,
            entry.address()
        );
        Ok(Self { id, region, entry })
    }

    fn load_image(image: &ElfImage, mode: MemoryMode) -> Result<(ProtectedMemory, EntryPoint)> {
        let mut region = ProtectedMemory::new(image.required_memory_size(), mode)?;
        // a new region reads as zero, so only overlapping tails need clearing
        image.load_zeroed(region.writable_view()?)?;
        // only file bytes were written, every other page is still fresh
        for seg in image.segments() {
            region.sync_instruction_cache(usize::try_from(seg.destination)?, seg.source_len)?;
        }
        let entry = EntryPoint::new(&region, image.entry_offset())?;
        Ok((region, entry))
    }

    /// The identifier assigned by the executor
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The absolute address the payload will start at
    pub fn entry_address(&self) -> *const u8 {
        self.entry.address()
    }

    /// The region backing the payload
    pub fn region(&self) -> &ProtectedMemory {
        &self.region
    }

    /// Run the payload on the current thread, then release its region.
    /// Blocks for the payload's full runtime.
    #[instrument(skip(self), fields(id = self.id), parent = Span::current(), level= "Trace")]
    pub fn run(mut self) -> i32 {
        // SAFETY: the region is owned by self and was loaded in `load`, and
        // it is only released below, after the payload has returned
        let exit_code = unsafe { self.entry.invoke() };
        log::info!("payload {} returned {}", self.id, exit_code);
        if let Err(e) = self.region.destroy() {
            log::error!("payload {}: releasing memory failed: {}", self.id, e);
        }
        exit_code
    }
}

#[cfg(test)]
mod tests {
    use elfldr_testing::elf::{ElfBuilder, PF_R, PF_X};

    use super::PayloadExecution;
    use crate::config::MemoryMode;
    use crate::error::LoaderError;
    use crate::mem::elf::ElfImage;
    use crate::Result;

    #[test]
    fn load_places_image_in_fresh_region() -> Result<()> {
        let image = ElfImage::new(
            ElfBuilder::new()
                .entry(0x20)
                .segment(0x20, &[0xcc, 0xc3], 0x40, PF_R | PF_X)
                .build(),
        )?;
        let exec = PayloadExecution::load(3, image, MemoryMode::Direct)?;
        assert_eq!(exec.id(), 3);
        let base = exec.region().executable_base()? as usize;
        assert_eq!(exec.entry_address() as usize, base + 0x20);

        let seen = unsafe { std::slice::from_raw_parts(base as *const u8, 0x60) };
        assert!(seen[..0x20].iter().all(|&b| b == 0));
        assert_eq!(&seen[0x20..0x22], &[0xcc, 0xc3]);
        assert!(seen[0x22..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn dropping_unrun_payload_is_fine() -> Result<()> {
        let image = ElfImage::new(
            ElfBuilder::new()
                .segment(0, &[0xc3], 1, PF_R | PF_X)
                .build(),
        )?;
        let exec = PayloadExecution::load(1, image, MemoryMode::Emulated)?;
        assert!(!exec.region().is_released());
        drop(exec);
        Ok(())
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn run_returns_exit_code_and_releases() -> Result<()> {
        for mode in [MemoryMode::Direct, MemoryMode::Emulated] {
            let image = ElfImage::new(elfldr_testing::payload_returning(42))?;
            let exec = PayloadExecution::load(0, image, mode)?;
            assert_eq!(exec.run(), 42);
        }
        Ok(())
    }

    #[test]
    fn huge_footprint_fails_without_leaking() {
        let image = ElfImage::new(
            ElfBuilder::new()
                .entry(0x7fff_ffff_ffff_0000)
                .segment(0x7fff_ffff_ffff_0000, &[0xc3], 0x100, PF_R | PF_X)
                .build(),
        )
        .unwrap();
        let err = PayloadExecution::load(9, image, MemoryMode::Direct).unwrap_err();
        assert!(!err.is_poison());
        assert!(matches!(
            err,
            LoaderError::AllocationFailure { .. } | LoaderError::MemoryRequestTooBig(_, _)
        ));
    }
}
