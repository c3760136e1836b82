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

// This crate contains testing utilities which need to be shared across the
// loader's unit tests, integration tests and fuzz targets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

pub mod elf;
pub mod simplelogger;

use elf::{ElfBuilder, PF_R, PF_X};

/// Machine code for `return code;` on this host
pub fn return_code(code: i32) -> Vec<u8> {
    let mut text = Vec::new();
    #[cfg(not(target_arch = "aarch64"))]
    {
        text.push(0xb8); // mov eax, imm32
        text.extend_from_slice(&code.to_le_bytes());
        text.push(0xc3); // ret
    }
    #[cfg(target_arch = "aarch64")]
    {
        push_mov_w0(&mut text, code);
        push_insn(&mut text, 0xd65f03c0); // ret
    }
    text
}

/// Machine code that sleeps for `duration` with `nanosleep(2)`, then
/// returns `code`. Whole seconds are limited to what fits the immediate
/// used to build the timespec.
pub fn sleep_then_return_code(duration: Duration, code: i32) -> Vec<u8> {
    let nanos = duration.subsec_nanos();
    let mut text = Vec::new();
    #[cfg(not(target_arch = "aarch64"))]
    {
        let secs = u32::try_from(duration.as_secs()).unwrap_or(i32::MAX as u32) & 0x7fff_ffff;
        text.push(0x68); // push tv_nsec
        text.extend_from_slice(&nanos.to_le_bytes());
        text.push(0x68); // push tv_sec
        text.extend_from_slice(&secs.to_le_bytes());
        text.extend_from_slice(&[0x48, 0x89, 0xe7]); // mov rdi, rsp
        text.extend_from_slice(&[0x31, 0xf6]); // xor esi, esi
        text.extend_from_slice(&[0xb8, 35, 0, 0, 0]); // mov eax, SYS_nanosleep
        text.extend_from_slice(&[0x0f, 0x05]); // syscall
        text.extend_from_slice(&[0x48, 0x83, 0xc4, 0x10]); // add rsp, 16
    }
    #[cfg(target_arch = "aarch64")]
    {
        let secs = u16::try_from(duration.as_secs()).unwrap_or(u16::MAX) as u32;
        push_insn(&mut text, 0xd10043ff); // sub sp, sp, #16
        push_insn(&mut text, 0xd2800009 | (secs << 5)); // movz x9, #secs
        push_insn(&mut text, 0xf90003e9); // str x9, [sp]
        push_insn(&mut text, 0xd2800009 | ((nanos & 0xffff) << 5)); // movz x9, #lo
        push_insn(&mut text, 0xf2a00009 | ((nanos >> 16) << 5)); // movk x9, #hi, lsl 16
        push_insn(&mut text, 0xf90007e9); // str x9, [sp, #8]
        push_insn(&mut text, 0x910003e0); // mov x0, sp
        push_insn(&mut text, 0xd2800001); // mov x1, #0
        push_insn(&mut text, 0xd2800ca8); // mov x8, #SYS_nanosleep
        push_insn(&mut text, 0xd4000001); // svc #0
        push_insn(&mut text, 0x910043ff); // add sp, sp, #16
    }
    let tail = return_code(code);
    text.extend_from_slice(&tail);
    text
}

#[cfg(target_arch = "aarch64")]
fn push_insn(text: &mut Vec<u8>, insn: u32) {
    text.extend_from_slice(&insn.to_le_bytes());
}

#[cfg(target_arch = "aarch64")]
fn push_mov_w0(text: &mut Vec<u8>, value: i32) {
    let value = value as u32;
    push_insn(text, 0x52800000 | ((value & 0xffff) << 5)); // movz w0, #lo
    push_insn(text, 0x72a00000 | ((value >> 16) << 5)); // movk w0, #hi, lsl 16
}

/// A minimal ELF with one executable segment at offset 0 holding `text`,
/// entered at its first byte
pub fn payload_with_text(text: &[u8]) -> Vec<u8> {
    ElfBuilder::new()
        .entry(0)
        .segment(0, text, text.len() as u64, PF_R | PF_X)
        .build()
}

/// A minimal ELF whose entry point returns `code`
pub fn payload_returning(code: i32) -> Vec<u8> {
    payload_with_text(&return_code(code))
}

/// A minimal ELF whose entry point sleeps for `duration`, then returns
/// `code`
pub fn payload_sleeping(duration: Duration, code: i32) -> Vec<u8> {
    payload_with_text(&sleep_then_return_code(duration, code))
}

/// Send `payload` to the loader at `addr`, close the write side and wait
/// for the loader to close the connection, which it does once the whole
/// payload has been consumed.
pub fn submit_payload(addr: SocketAddr, payload: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(payload)?;
    stream.shutdown(Shutdown::Write)?;
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(_) => Ok(()),
        // the loader may reset the connection instead of closing it
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{payload_returning, payload_sleeping, return_code};

    #[test]
    fn payloads_are_elf() {
        for payload in [
            payload_returning(1),
            payload_sleeping(Duration::from_millis(5), 1),
        ] {
            assert_eq!(&payload[..4], b"\x7fELF");
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn return_code_encoding() {
        assert_eq!(return_code(0x1234), vec![0xb8, 0x34, 0x12, 0, 0, 0xc3]);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn return_code_encoding() {
        assert_eq!(return_code(7).len(), 12);
    }
}
