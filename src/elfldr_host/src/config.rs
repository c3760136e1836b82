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

use std::path::PathBuf;
use std::time::Duration;

use tracing::{instrument, Span};

/// Where payloads come from
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InputMode {
    /// Load a single ELF from the given path and run it synchronously
    File(PathBuf),
    /// Accept payloads on the payload server port
    Network,
}

/// How a region provides its writable and executable views
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MemoryMode {
    /// Two mappings of one shared backing object, one writable and one
    /// executable, so no single mapping is ever writable and executable
    #[default]
    Direct,
    /// A single mapping that is writable and executable at once
    Emulated,
}

/// How accepted payloads are scheduled
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ThreadingMode {
    /// Accept one payload and run it on the current thread
    #[default]
    None,
    /// Keep accepting and give every payload its own detached thread
    PerPayload,
}

/// The complete set of configuration needed by the loader process
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoaderConfiguration {
    input_mode: InputMode,
    memory_mode: MemoryMode,
    threading_mode: ThreadingMode,
    /// Enables trace level logging
    debug: bool,
    /// TCP port payloads are submitted to
    port: u16,
    /// Listen backlog of the payload server
    backlog: i32,
    /// Number of bind attempts before giving up
    retry_count: u32,
    /// Delay after each failed bind attempt
    retry_delay: Duration,
}

impl LoaderConfiguration {
    /// The default payload server port
    pub const DEFAULT_PORT: u16 = 5053;
    /// The default listen backlog
    pub const DEFAULT_BACKLOG: i32 = 10;
    /// The default number of bind attempts
    pub const DEFAULT_RETRY_COUNT: u32 = 20;
    /// The default delay after a failed bind attempt
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
    /// The minimum listen backlog
    pub const MIN_BACKLOG: i32 = 1;

    /// Create a new configuration. The server settings start at their
    /// defaults and may be adjusted with the `with_*` methods before the
    /// configuration is handed to the loader.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn new(
        input_mode: InputMode,
        memory_mode: MemoryMode,
        threading_mode: ThreadingMode,
        debug: bool,
    ) -> Self {
        Self {
            input_mode,
            memory_mode,
            threading_mode,
            debug,
            port: Self::DEFAULT_PORT,
            backlog: Self::DEFAULT_BACKLOG,
            retry_count: Self::DEFAULT_RETRY_COUNT,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
        }
    }

    /// Use `port` for the payload server
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use `backlog` for the payload server, clamped to `MIN_BACKLOG`
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog.max(Self::MIN_BACKLOG);
        self
    }

    /// Set the bind retry budget. A count of 0 still makes one attempt.
    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Where payloads come from
    pub fn input_mode(&self) -> &InputMode {
        &self.input_mode
    }

    /// How regions are backed
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    /// How payloads are scheduled
    pub fn threading_mode(&self) -> ThreadingMode {
        self.threading_mode
    }

    /// Whether trace logging was requested
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// The payload server port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The payload server listen backlog
    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    /// The number of bind attempts
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// The delay after each failed bind attempt
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }
}

impl Default for LoaderConfiguration {
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    fn default() -> Self {
        Self::new(
            InputMode::Network,
            MemoryMode::default(),
            ThreadingMode::default(),
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::{InputMode, LoaderConfiguration, MemoryMode, ThreadingMode};

    #[test]
    fn defaults() {
        let cfg = LoaderConfiguration::default();
        assert_eq!(cfg.input_mode(), &InputMode::Network);
        assert_eq!(cfg.memory_mode(), MemoryMode::Direct);
        assert_eq!(cfg.threading_mode(), ThreadingMode::None);
        assert!(!cfg.debug());
        assert_eq!(cfg.port(), 5053);
        assert_eq!(cfg.backlog(), 10);
        assert_eq!(cfg.retry_count(), 20);
        assert_eq!(cfg.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn overrides() {
        let cfg = LoaderConfiguration::new(
            InputMode::File("payload.elf".into()),
            MemoryMode::Emulated,
            ThreadingMode::PerPayload,
            true,
        )
        .with_port(6000)
        .with_backlog(0)
        .with_retry(0, Duration::from_millis(5));

        assert_eq!(cfg.input_mode(), &InputMode::File("payload.elf".into()));
        assert_eq!(cfg.memory_mode(), MemoryMode::Emulated);
        assert_eq!(cfg.threading_mode(), ThreadingMode::PerPayload);
        assert!(cfg.debug());
        assert_eq!(cfg.port(), 6000);
        assert_eq!(cfg.backlog(), LoaderConfiguration::MIN_BACKLOG);
        assert_eq!(cfg.retry_count(), 1);
        assert_eq!(cfg.retry_delay(), Duration::from_millis(5));
    }

    proptest! {
        #[test]
        fn backlog_never_below_minimum(backlog in i32::MIN..i32::MAX) {
            let cfg = LoaderConfiguration::default().with_backlog(backlog);
            prop_assert!(cfg.backlog() >= LoaderConfiguration::MIN_BACKLOG);
            if backlog >= LoaderConfiguration::MIN_BACKLOG {
                prop_assert_eq!(cfg.backlog(), backlog);
            }
        }
    }
}
