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
#![deny(dead_code, missing_docs, unused_mut)]
//! This crate loads native ELF payloads received over a socket (or read
//! from a file) into freshly mapped memory and calls their entry point,
//! either on the calling thread or on one dedicated thread per payload.

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

/// Process-wide configuration: input, memory and threading modes plus the
/// fixed server settings
pub mod config;
/// Dealing with errors
pub mod error;
/// Running loaded payloads and owning their lifecycle
pub mod exec;
/// Protected memory regions and the ELF loader that fills them.
///
/// - Direct regions expose two mappings of one memfd object
///
/// ```text
///     writable view    RW-  ──┐
///                             ├── same bytes
///     executable view  R-X  ──┘
/// ```
///
/// - Emulated regions are a single RWX mapping, so both views share an address
pub mod mem;
/// The TCP server that payloads are submitted to
pub mod server;
/// Signal handling for the loader process
pub mod signal_handlers;

/// The re-export for the `LoaderConfiguration` type
pub use config::{InputMode, LoaderConfiguration, MemoryMode, ThreadingMode};
/// The re-export for the `LoaderError` type
pub use error::LoaderError;
/// The re-export for the execution manager and its outcomes
pub use exec::executor::{PayloadExecutor, PayloadReport, ServeSummary, StopReason};
/// The re-export for the `ElfImage` type
pub use mem::elf::ElfImage;
/// The re-export for the `ProtectedMemory` type
pub use mem::protected_mem::ProtectedMemory;
/// The re-export for the server types
pub use server::listener::{PayloadServer, ServerHandle};

/// The universal `Result` type used throughout the loader.
pub type Result<T> = core::result::Result<T, error::LoaderError>;

/// Logs an error then returns with it, more or less equivalent to the bail! macro in anyhow
/// but for LoaderError instead of anyhow::Error
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        let __err = $crate::LoaderError::Error(__err_msg);
        log::error!("{}", __err);
        return Err(__err);
    }};
    ($err:expr $(,)?) => {
        log::error!("{}", $err);
        return Err($err);
    };
    ($fmtstr:expr, $($arg:tt)*) => {
           let __err_msg = std::format!($fmtstr, $($arg)*);
           let __err = $crate::error::LoaderError::Error(__err_msg);
           log::error!("{}", __err);
           return Err(__err);
    };
}
