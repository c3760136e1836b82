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

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::Sender;
use tracing::{instrument, Span};

use super::context::PayloadExecution;
use crate::config::MemoryMode;
use crate::error::LoaderError::{FileOpenFailure, SpawnFailure};
use crate::mem::elf::ElfImage;
use crate::server::listener::{PayloadServer, ServerHandle};
use crate::Result;

/// Sent once for every payload that has finished running and whose memory
/// has been released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadReport {
    /// The identifier the executor assigned to the payload
    pub id: u64,
    /// The value the payload's entry point returned
    pub exit_code: i32,
}

/// Why `serve_forever` stopped accepting payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Accepting a connection failed, normally because the server was shut
    /// down
    AcceptFailed,
    /// A client sent an empty, unreadable or invalid payload
    PoisonPayload,
}

/// What happened while serving payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    /// Connections accepted
    pub accepted: u64,
    /// Payloads handed to their own thread
    pub spawned: u64,
    /// Payloads that were valid but could not be loaded or started
    pub failed: u64,
    /// Why the loop ended
    pub stop: StopReason,
}

/// Loads payloads into protected memory and runs them, owning the rule for
/// when each payload's memory is released.
#[derive(Debug)]
pub struct PayloadExecutor {
    memory_mode: MemoryMode,
    reporter: Option<Sender<PayloadReport>>,
    next_id: AtomicU64,
}

impl PayloadExecutor {
    /// Create an executor that backs every payload with `memory_mode` regions
    pub fn new(memory_mode: MemoryMode) -> Self {
        Self {
            memory_mode,
            reporter: None,
            next_id: AtomicU64::new(0),
        }
    }

    /// Send a `PayloadReport` on `reporter` whenever a payload finishes
    pub fn with_reporter(mut self, reporter: Sender<PayloadReport>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// The memory strategy used for every payload
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    /// Validate `payload` and load it into a fresh region.
    ///
    /// Validation failures are reported with errors for which
    /// `LoaderError::is_poison` holds. Any other error means a valid payload
    /// could not be loaded.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn prepare(&self, payload: Vec<u8>) -> Result<PayloadExecution> {
        let image = ElfImage::new(payload)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        PayloadExecution::load(id, image, self.memory_mode)
    }

    /// Run `exec` on the calling thread and return its exit code
    pub fn run_sync(&self, exec: PayloadExecution) -> i32 {
        let id = exec.id();
        let exit_code = exec.run();
        report(self.reporter.as_ref(), id, exit_code);
        exit_code
    }

    /// Run `exec` on a new, detached thread that releases the payload's
    /// memory when it returns. If the thread cannot be started the memory is
    /// released before returning the error.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn run_async(&self, exec: PayloadExecution) -> Result<()> {
        let id = exec.id();
        let reporter = self.reporter.clone();
        thread::Builder::new()
            .name(format!("elfldr-payload-{}", id))
            .spawn(move || {
                let exit_code = exec.run();
                report(reporter.as_ref(), id, exit_code);
            })
            .map_err(SpawnFailure)?;
        log::debug!("payload {} running on its own thread", id);
        Ok(())
    }

    /// Accept exactly one payload and run it on the calling thread.
    ///
    /// The server is closed straight after the accept, whatever happens to
    /// the payload.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level= "Trace")]
    pub fn run_once(&self, server: PayloadServer) -> Result<i32> {
        let accepted = server.accept_one();
        server.close();
        let payload = PayloadServer::receive_payload(accepted?)?;
        let exec = self.prepare(payload)?;
        Ok(self.run_sync(exec))
    }

    /// Accept payloads until accepting fails or a client sends a payload that
    /// is empty or not loadable, running each valid payload on its own
    /// thread. Never waits for running payloads; the server is closed on
    /// return.
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn serve_forever(&self, server: PayloadServer) -> ServeSummary {
        let mut accepted = 0;
        let mut spawned = 0;
        let mut failed = 0;

        let stop = loop {
            let stream = match server.accept_one() {
                Ok(stream) => stream,
                Err(e) => {
                    log::info!("accept loop stopping: {}", e);
                    break StopReason::AcceptFailed;
                }
            };
            accepted += 1;

            let payload = match PayloadServer::receive_payload(stream) {
                Ok(payload) => payload,
                Err(e) => {
                    log::info!("accept loop stopping on bad payload: {}", e);
                    break StopReason::PoisonPayload;
                }
            };

            let exec = match self.prepare(payload) {
                Ok(exec) => exec,
                Err(e) if e.is_poison() => {
                    log::info!("accept loop stopping on invalid payload: {}", e);
                    break StopReason::PoisonPayload;
                }
                Err(e) => {
                    log::error!("dropping payload: {}", e);
                    failed += 1;
                    continue;
                }
            };

            match self.run_async(exec) {
                Ok(()) => spawned += 1,
                Err(e) => {
                    log::error!("dropping payload: {}", e);
                    failed += 1;
                }
            }
        };

        server.close();
        let summary = ServeSummary {
            accepted,
            spawned,
            failed,
            stop,
        };
        log::info!("payload server closed: {:?}", summary);
        summary
    }

    /// Read a payload from `path` and run it on the calling thread.
    ///
    /// Fails with `FileOpenFailure` if the file cannot be opened or read.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level= "Trace")]
    pub fn run_file(&self, path: &Path) -> Result<i32> {
        let file_err = |source| FileOpenFailure {
            path: path.to_path_buf(),
            source,
        };
        let mut payload = Vec::new();
        File::open(path)
            .and_then(|mut file| file.read_to_end(&mut payload))
            .map_err(file_err)?;
        log::debug!("read {} bytes from {}", payload.len(), path.display());

        let exec = self.prepare(payload)?;
        Ok(self.run_sync(exec))
    }

    /// Stop the server behind `handle`, unblocking its accept loop. Payloads
    /// already running are not waited for.
    pub fn shutdown(handle: &ServerHandle) -> bool {
        handle.shutdown()
    }
}

fn report(reporter: Option<&Sender<PayloadReport>>, id: u64, exit_code: i32) {
    if let Some(reporter) = reporter {
        if reporter.send(PayloadReport { id, exit_code }).is_err() {
            log::trace!("no one is listening for the report of payload {}", id);
        }
    }
}
