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

use std::num::TryFromIntError;
use std::path::PathBuf;

use thiserror::Error;

/// The error type for loader operations
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Accepting a client on the listening socket failed, usually because
    /// the socket was shut down from another thread
    #[error("Accept on the payload server failed: {0:?}")]
    AcceptFailure(Option<std::io::Error>),

    /// Backing memory or its permission setup could not be obtained
    #[error("Memory Allocation Failed in {op} with OS Error {errno:?}.")]
    AllocationFailure {
        /// the system call that failed
        op: &'static str,
        /// the OS error code, if there was one
        errno: Option<i32>,
    },

    /// The listening socket could not be bound after exhausting all retries
    #[error("Could not bind port {port} after {attempts} attempts: {source}")]
    BindFailure {
        /// port that was requested
        port: u16,
        /// number of bind attempts that were made
        attempts: u32,
        /// the error returned by the last attempt
        #[source]
        source: std::io::Error,
    },

    /// goblin rejected the ELF structures
    #[error("Failure parsing ELF structures {0:?}")]
    ElfParseFailure(#[from] goblin::error::Error),

    /// A client closed its connection without sending any bytes
    #[error("Payload was empty")]
    EmptyPayload,

    /// The entry offset does not fall inside the allocated region
    #[error("Entry offset {0:#x} is outside of a region of size {1:#x}")]
    EntryOutOfBounds(u64, usize),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// An input file could not be opened or read
    #[error("Could not read input file {path:?}: {source}")]
    FileOpenFailure {
        /// the path that was requested
        path: PathBuf,
        /// the underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Reading Writing or Seeking data failed.
    #[error("Reading Writing or Seeking data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// Failed to convert to Integer
    #[error("Failed To Convert Size to usize")]
    IntConversionFailure(#[from] TryFromIntError),

    /// Copying segments into the destination failed
    #[error("ELF image could not be loaded: {0}")]
    LoadFailure(String),

    /// The region has already been released
    #[error("Protected memory has already been released")]
    MemoryReleased,

    /// The memory request exceeds the maximum size allowed
    #[error("Memory requested {0} exceeds maximum size allowed {1}")]
    MemoryRequestTooBig(usize, usize),

    /// The buffer is not an ELF image this host can load
    #[error("Not a loadable ELF image: {0}")]
    NotLoadable(String),

    /// Unmapping a region failed; the region is considered released anyway
    #[error("munmap failed with os error {0:?}")]
    ReleaseFailure(Option<i32>),

    /// A payload thread could not be spawned
    #[error("Failed to spawn payload thread: {0}")]
    SpawnFailure(#[source] std::io::Error),
}

impl LoaderError {
    /// Whether this error is the designed "stop serving" signal: the peer
    /// sent nothing, or what it sent is not a loadable image.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            LoaderError::EmptyPayload | LoaderError::NotLoadable(_) | LoaderError::ElfParseFailure(_)
        )
    }
}

/// Creates a `LoaderError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::LoaderError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::LoaderError::Error(__err_msg)
    }};
}

#[cfg(test)]
mod tests {
    use super::LoaderError;

    #[test]
    fn poison_classification() {
        assert!(LoaderError::EmptyPayload.is_poison());
        assert!(LoaderError::NotLoadable("bad magic".to_string()).is_poison());
        assert!(!LoaderError::AllocationFailure {
            op: "mmap",
            errno: Some(12)
        }
        .is_poison());
        assert!(!LoaderError::AcceptFailure(None).is_poison());
        assert!(!LoaderError::LoadFailure("too big".to_string()).is_poison());
    }

    #[test]
    fn new_error_formats() {
        let e = new_error!("segment {} is {}", 1, "broken");
        assert!(matches!(e, LoaderError::Error(ref m) if m == "segment 1 is broken"));
        let e = new_error!("plain");
        assert_eq!(e.to_string(), "plain");
    }
}
