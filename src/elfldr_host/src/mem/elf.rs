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

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::Range;

use bitflags::bitflags;
use goblin::container::Ctx;
#[cfg(target_arch = "aarch64")]
use goblin::elf::header::EM_AARCH64;
#[cfg(target_arch = "x86_64")]
use goblin::elf::header::EM_X86_64;
use goblin::elf::header::{EI_CLASS, EI_DATA, ELFCLASS64, ELFDATA2LSB};
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use goblin::elf64::header::SIZEOF_EHDR;
use goblin::elf64::program_header::SIZEOF_PHDR;
use tracing::{instrument, Span};

use super::ptr_offset::Offset;
use crate::error::LoaderError::{LoadFailure, NotLoadable};
use crate::{log_then_return, Result};

#[cfg(target_arch = "x86_64")]
const HOST_MACHINE: u16 = EM_X86_64;
#[cfg(target_arch = "aarch64")]
const HOST_MACHINE: u16 = EM_AARCH64;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const HOST_MACHINE: u16 = goblin::elf::header::EM_NONE;

bitflags! {
    /// permissions requested by a loadable segment
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// segment is readable
        const READ = PF_R;
        /// segment is writable
        const WRITE = PF_W;
        /// segment is executable
        const EXECUTE = PF_X;
    }
}

impl Display for SegmentFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(SegmentFlags::READ) { 'r' } else { '-' };
        let w = if self.contains(SegmentFlags::WRITE) { 'w' } else { '-' };
        let x = if self.contains(SegmentFlags::EXECUTE) { 'x' } else { '-' };
        write!(f, "{}{}{}", r, w, x)
    }
}

/// A `PT_LOAD` segment of a validated image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoadableSegment {
    /// offset of the segment's bytes in the source buffer
    pub source_offset: usize,
    /// number of bytes backed by the source buffer
    pub source_len: usize,
    /// offset from the destination base the segment is copied to
    pub destination: Offset,
    /// size of the segment in memory, including any zero-filled tail
    pub destination_len: usize,
    /// requested permissions
    pub flags: SegmentFlags,
}

impl LoadableSegment {
    /// The offset one past the last byte of the segment in memory
    fn destination_end(&self) -> Option<usize> {
        usize::try_from(self.destination)
            .ok()?
            .checked_add(self.destination_len)
    }
}

/// The parts of an ELF image needed to load and enter it
#[derive(Debug)]
struct Layout {
    entry: Offset,
    segments: Vec<LoadableSegment>,
    required_size: usize,
}

/// An owned, validated ELF image.
///
/// Construction only succeeds for images that can be loaded on this host, so
/// every accessor is infallible. The loader works purely in offsets relative
/// to a caller supplied destination and never touches executable memory.
#[derive(Debug)]
pub struct ElfImage {
    payload: Vec<u8>,
    layout: Layout,
}

impl ElfImage {
    /// Whether `bytes` is an image this host can load. "Not loadable" is an
    /// expected outcome, so the reason is only logged.
    pub fn is_loadable(bytes: &[u8]) -> bool {
        match parse_layout(bytes) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("payload of {} bytes is not loadable: {}", bytes.len(), e);
                false
            }
        }
    }

    /// Validate `payload` and take ownership of it
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(payload: Vec<u8>) -> Result<Self> {
        let layout = parse_layout(&payload)?;
        log::debug!(
            "ELF image: {} bytes, {} loadable segments, entry {}, needs {:#x} bytes",
            payload.len(),
            layout.segments.len(),
            layout.entry,
            layout.required_size
        );
        Ok(Self { payload, layout })
    }

    /// Size of the source buffer in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Always false, since a loadable image holds at least an ELF header
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The smallest contiguous extent, starting at offset 0, that contains
    /// every segment's destination range
    pub fn required_memory_size(&self) -> usize {
        self.layout.required_size
    }

    /// Offset of the entry point relative to the destination base
    pub fn entry_offset(&self) -> Offset {
        self.layout.entry
    }

    /// The loadable segments, in program header order
    pub fn segments(&self) -> &[LoadableSegment] {
        &self.layout.segments
    }

    /// Copy every loadable segment into `target`, the writable view of the
    /// destination, whatever it held before.
    ///
    /// Segments are applied in program header order, so where two overlap
    /// the later one wins, including its zero-filled tail. Gaps between
    /// segments read as zero afterwards. Bytes past `required_memory_size`
    /// are left untouched.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn load(&self, target: &mut [u8]) -> Result<()> {
        self.check_fits(target.len())?;
        self.zero_gaps(target);
        for seg in &self.layout.segments {
            let dst = self.copy_segment(seg, target)?;
            target[dst + seg.source_len..dst + seg.destination_len].fill(0);
        }
        Ok(())
    }

    /// Same result as `load`, for a destination that already reads as all
    /// zero, such as a freshly mapped region.
    ///
    /// Only bytes written by an earlier segment are ever cleared, so pages
    /// covered by nothing but gaps and zero-filled tails are never touched
    /// and stay uncommitted. Handing in a destination that is not all zero
    /// leaves those bytes as they were.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn load_zeroed(&self, target: &mut [u8]) -> Result<()> {
        self.check_fits(target.len())?;
        let mut written = WrittenRanges::default();
        for seg in &self.layout.segments {
            let dst = self.copy_segment(seg, target)?;
            let file_end = dst + seg.source_len;
            for stale in written.take(file_end, dst + seg.destination_len) {
                target[stale].fill(0);
            }
            written.insert(dst, file_end);
        }
        Ok(())
    }

    fn check_fits(&self, target_len: usize) -> Result<()> {
        let limit = target_len.min(self.layout.required_size);
        for (i, seg) in self.layout.segments.iter().enumerate() {
            match seg.destination_end() {
                Some(end) if end <= limit => {}
                _ => {
                    log_then_return!(LoadFailure(format!(
                        "segment {} at {} ({:#x} bytes) exceeds destination of {:#x} bytes",
                        i, seg.destination, seg.destination_len, limit
                    )));
                }
            }
        }
        Ok(())
    }

    /// Zero every byte below `required_size` that no segment covers
    fn zero_gaps(&self, target: &mut [u8]) {
        let mut covered: Vec<(usize, usize)> = self
            .layout
            .segments
            .iter()
            .filter_map(|seg| {
                let start = usize::try_from(seg.destination).ok()?;
                Some((start, seg.destination_end()?))
            })
            .collect();
        covered.sort_unstable();

        let mut cursor = 0;
        for (start, end) in covered {
            if start > cursor {
                target[cursor..start].fill(0);
            }
            cursor = cursor.max(end);
        }
        if cursor < self.layout.required_size {
            target[cursor..self.layout.required_size].fill(0);
        }
    }

    /// Copy the file-backed part of `seg` and return its destination offset.
    /// Bounds were established by `parse_layout` and `check_fits`.
    fn copy_segment(&self, seg: &LoadableSegment, target: &mut [u8]) -> Result<usize> {
        let dst = usize::try_from(seg.destination)?;
        let src = &self.payload[seg.source_offset..seg.source_offset + seg.source_len];
        target[dst..dst + seg.source_len].copy_from_slice(src);
        log::trace!(
            "loaded segment {} [{}] {:#x}/{:#x} bytes",
            seg.destination,
            seg.flags,
            seg.source_len,
            seg.destination_len
        );
        Ok(dst)
    }

    /// Free the source buffer. The loaded code never needs it again.
    pub fn release(self) {
        log::trace!("releasing ELF source buffer of {} bytes", self.payload.len());
    }
}

/// Disjoint byte ranges of a destination that hold segment file bytes,
/// keyed by start
#[derive(Debug, Default)]
struct WrittenRanges(BTreeMap<usize, usize>);

impl WrittenRanges {
    fn insert(&mut self, mut start: usize, mut end: usize) {
        if start >= end {
            return;
        }
        let touching: Vec<(usize, usize)> = self
            .0
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.0.remove(&s);
            start = start.min(s);
            end = end.max(e);
        }
        self.0.insert(start, end);
    }

    /// Remove and return the parts of `[start, end)` that were written
    fn take(&mut self, start: usize, end: usize) -> Vec<Range<usize>> {
        if start >= end {
            return Vec::new();
        }
        let overlapping: Vec<(usize, usize)> = self
            .0
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        let mut taken = Vec::with_capacity(overlapping.len());
        for (s, e) in overlapping {
            self.0.remove(&s);
            if s < start {
                self.0.insert(s, start);
            }
            if e > end {
                self.0.insert(end, e);
            }
            taken.push(s.max(start)..e.min(end));
        }
        taken
    }
}

fn parse_layout(bytes: &[u8]) -> Result<Layout> {
    if bytes.len() < SIZEOF_EHDR {
        return Err(NotLoadable(format!(
            "{} bytes is smaller than an ELF header",
            bytes.len()
        )));
    }

    let header = Elf::parse_header(bytes)?;
    if header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(NotLoadable("only 64-bit images are supported".to_string()));
    }
    if header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(NotLoadable(
            "only little-endian images are supported".to_string(),
        ));
    }
    if header.e_machine != HOST_MACHINE {
        return Err(NotLoadable(format!(
            "machine {} does not match host machine {}",
            header.e_machine, HOST_MACHINE
        )));
    }
    if usize::from(header.e_phentsize) != SIZEOF_PHDR {
        return Err(NotLoadable(format!(
            "unexpected program header size {}",
            header.e_phentsize
        )));
    }

    let phnum = usize::from(header.e_phnum);
    let table_fits = usize::try_from(header.e_phoff)
        .ok()
        .and_then(|off| off.checked_add(phnum * SIZEOF_PHDR))
        .is_some_and(|end| end <= bytes.len());
    if !table_fits {
        return Err(NotLoadable(
            "program header table lies outside the image".to_string(),
        ));
    }

    let ctx = Ctx::new(header.container()?, header.endianness()?);
    let phdrs = ProgramHeader::parse(bytes, header.e_phoff as usize, phnum, ctx)?;

    let mut segments = Vec::new();
    let mut required_size = 0usize;
    for phdr in phdrs.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
        let segment = loadable_segment(phdr, bytes.len())?;
        let end = segment
            .destination_end()
            .ok_or_else(|| NotLoadable("segment end overflows".to_string()))?;
        required_size = required_size.max(end);
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(NotLoadable(
            "ELF must have at least one PT_LOAD header".to_string(),
        ));
    }

    let entry = Offset::from(header.e_entry);
    let entry_inside = segments.iter().any(|seg| {
        let start = u64::from(seg.destination);
        let len = seg.destination_len as u64;
        entry >= seg.destination && u64::from(entry) - start < len
    });
    if !entry_inside {
        return Err(NotLoadable(format!(
            "entry {} is outside every loadable segment",
            entry
        )));
    }

    Ok(Layout {
        entry,
        segments,
        required_size,
    })
}

fn loadable_segment(phdr: &ProgramHeader, image_len: usize) -> Result<LoadableSegment> {
    if phdr.p_filesz > phdr.p_memsz {
        return Err(NotLoadable(format!(
            "segment at {:#x} has more file bytes ({:#x}) than memory ({:#x})",
            phdr.p_vaddr, phdr.p_filesz, phdr.p_memsz
        )));
    }

    let too_big = |what: &str| NotLoadable(format!("segment {} does not fit in usize", what));
    let source_offset = usize::try_from(phdr.p_offset).map_err(|_| too_big("offset"))?;
    let source_len = usize::try_from(phdr.p_filesz).map_err(|_| too_big("file size"))?;
    let destination_len = usize::try_from(phdr.p_memsz).map_err(|_| too_big("memory size"))?;

    match source_offset.checked_add(source_len) {
        Some(end) if end <= image_len => {}
        _ => {
            return Err(NotLoadable(format!(
                "segment file range {:#x}+{:#x} lies outside the image",
                source_offset, source_len
            )));
        }
    }

    Ok(LoadableSegment {
        source_offset,
        source_len,
        destination: Offset::from(phdr.p_vaddr),
        destination_len,
        flags: SegmentFlags::from_bits_truncate(phdr.p_flags),
    })
}
