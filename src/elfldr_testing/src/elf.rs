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

//! Builds small ELF64 little-endian images in memory. Only the parts the
//! loader looks at are filled in: no sections, no symbols.

pub use goblin::elf::header::{ELFCLASS32, ELFDATA2MSB, EM_AARCH64, EM_RISCV, EM_X86_64};
pub use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD, PT_NOTE};
pub use goblin::elf64::header::SIZEOF_EHDR;
pub use goblin::elf64::program_header::SIZEOF_PHDR;
use goblin::elf::header::{ELFCLASS64, ELFDATA2LSB, ELFMAG, ET_EXEC, EV_CURRENT};

/// The machine of the host running the tests
#[cfg(not(target_arch = "aarch64"))]
pub const HOST_MACHINE: u16 = EM_X86_64;
/// The machine of the host running the tests
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINE: u16 = EM_AARCH64;

#[derive(Clone, Debug)]
struct Segment {
    p_type: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
    flags: u32,
}

/// Builder for ELF64 images targeting the host machine by default
#[derive(Clone, Debug)]
pub struct ElfBuilder {
    machine: u16,
    entry: u64,
    segments: Vec<Segment>,
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfBuilder {
    /// An image for the host machine with entry 0 and no segments
    pub fn new() -> Self {
        Self {
            machine: HOST_MACHINE,
            entry: 0,
            segments: Vec::new(),
        }
    }

    /// Override `e_machine`
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Set `e_entry`
    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// Add a `PT_LOAD` segment placed at `vaddr` holding `data` and taking
    /// `memsz` bytes in memory
    pub fn segment(self, vaddr: u64, data: &[u8], memsz: u64, flags: u32) -> Self {
        self.program_header(PT_LOAD, vaddr, data, memsz, flags)
    }

    /// Add a program header of any type
    pub fn program_header(
        mut self,
        p_type: u32,
        vaddr: u64,
        data: &[u8],
        memsz: u64,
        flags: u32,
    ) -> Self {
        self.segments.push(Segment {
            p_type,
            vaddr,
            data: data.to_vec(),
            memsz,
            flags,
        });
        self
    }

    /// Lay out the header, the program header table and then every
    /// segment's bytes, in that order
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = Vec::with_capacity(SIZEOF_EHDR + phnum * SIZEOF_PHDR);

        out.extend_from_slice(ELFMAG);
        out.push(ELFCLASS64);
        out.push(ELFDATA2LSB);
        out.push(EV_CURRENT);
        out.resize(16, 0);
        push_u16(&mut out, ET_EXEC);
        push_u16(&mut out, self.machine);
        push_u32(&mut out, u32::from(EV_CURRENT));
        push_u64(&mut out, self.entry);
        push_u64(&mut out, SIZEOF_EHDR as u64); // e_phoff
        push_u64(&mut out, 0); // e_shoff
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, SIZEOF_EHDR as u16);
        push_u16(&mut out, SIZEOF_PHDR as u16);
        push_u16(&mut out, phnum as u16);
        push_u16(&mut out, 64); // e_shentsize
        push_u16(&mut out, 0); // e_shnum
        push_u16(&mut out, 0); // e_shstrndx

        let mut offset = (SIZEOF_EHDR + phnum * SIZEOF_PHDR) as u64;
        for seg in &self.segments {
            push_u32(&mut out, seg.p_type);
            push_u32(&mut out, seg.flags);
            push_u64(&mut out, offset);
            push_u64(&mut out, seg.vaddr);
            push_u64(&mut out, seg.vaddr);
            push_u64(&mut out, seg.data.len() as u64);
            push_u64(&mut out, seg.memsz);
            push_u64(&mut out, 0x10);
            offset += seg.data.len() as u64;
        }
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
