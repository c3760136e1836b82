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

// A thread safe logger for tests that records messages from the loader
// library so tests can assert on what was logged.

use std::sync::{Mutex, Once};

use log::{set_logger, set_max_level, Level, Log, Metadata, Record};

/// Only records whose target starts with this are captured
pub const LOADER_TARGET: &str = "elfldr_host";

pub static LOGGER: SimpleLogger = SimpleLogger {
    calls: Mutex::new(Vec::new()),
};
static INITLOGGER: Once = Once::new();

/// One captured log record
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct LogCall {
    pub level: Level,
    pub args: String,
    pub target: String,
}

pub struct SimpleLogger {
    calls: Mutex<Vec<LogCall>>,
}

impl SimpleLogger {
    /// Installs `LOGGER` as the process logger, once
    pub fn initialize_test_logger() {
        INITLOGGER.call_once(|| {
            set_logger(&LOGGER).unwrap();
            set_max_level(log::LevelFilter::Trace);
        });
    }

    /// Number of records captured since the last clear
    pub fn num_log_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Forget all captured records
    pub fn clear_log_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Whether any captured record at `level` contains `needle`
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|call| call.level == level && call.args.contains(needle))
    }

    /// Hand the captured records to `f`, then clear them
    pub fn test_log_records<F: Fn(&Vec<LogCall>)>(&self, f: F) {
        let mut calls = self.calls.lock().unwrap();
        f(&calls);
        calls.clear();
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.target().starts_with(LOADER_TARGET)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(LogCall {
                level: record.level(),
                args: format!("{}", record.args()),
                target: record.target().to_string(),
            });
        }
    }

    fn flush(&self) {}
}
