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

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use elfldr_host::{MemoryMode, PayloadExecutor, PayloadReport, PayloadServer, ServeSummary};

/// How long a test waits for a payload to report back
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// A server on an ephemeral port
pub fn new_server() -> PayloadServer {
    PayloadServer::listen(0, 16, 1, Duration::from_millis(10)).unwrap()
}

/// The loopback address a client uses to reach `server`
pub fn loopback(server: &PayloadServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

/// An executor reporting every finished payload on the returned channel
pub fn reporting_executor(mode: MemoryMode) -> (PayloadExecutor, Receiver<PayloadReport>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (PayloadExecutor::new(mode).with_reporter(tx), rx)
}

/// Run `serve_forever` on a background thread
pub fn serve_in_background(
    executor: PayloadExecutor,
    server: PayloadServer,
) -> JoinHandle<ServeSummary> {
    thread::spawn(move || executor.serve_forever(server))
}
