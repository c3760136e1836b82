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

#![cfg(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]

use std::collections::BTreeSet;
use std::io::Write;
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use elfldr_host::{LoaderError, MemoryMode, PayloadExecutor, StopReason};
use elfldr_testing::elf::{ElfBuilder, PF_R, PF_X};
use elfldr_testing::simplelogger::{SimpleLogger, LOGGER};
use elfldr_testing::{payload_returning, payload_sleeping, submit_payload};

pub mod common; // pub to disable dead_code warning
use crate::common::{
    loopback, new_server, reporting_executor, serve_in_background, REPORT_TIMEOUT,
};

#[test]
fn single_flow_runs_once_and_closes_listener() {
    for mode in [MemoryMode::Direct, MemoryMode::Emulated] {
        let server = new_server();
        let addr = loopback(&server);
        let (executor, reports) = reporting_executor(mode);

        let client = thread::spawn(move || submit_payload(addr, &payload_returning(7)).unwrap());
        let res = executor.run_once(server).unwrap();
        client.join().unwrap();

        assert_eq!(res, 7);
        assert_eq!(reports.recv_timeout(REPORT_TIMEOUT).unwrap().exit_code, 7);
        assert!(reports.try_recv().is_err());
        assert!(TcpStream::connect(addr).is_err());
    }
}

#[test]
fn single_flow_closes_listener_even_for_bad_payload() {
    let server = new_server();
    let addr = loopback(&server);
    let (executor, reports) = reporting_executor(MemoryMode::Direct);

    let client = thread::spawn(move || submit_payload(addr, b"definitely not an ELF").unwrap());
    let err = executor.run_once(server).unwrap_err();
    client.join().unwrap();

    assert!(err.is_poison());
    assert!(reports.try_recv().is_err());
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn threaded_runs_every_concurrent_payload() {
    const N: i32 = 8;
    let server = new_server();
    let addr = loopback(&server);
    let handle = server.handle();
    let (executor, reports) = reporting_executor(MemoryMode::Direct);
    let serving = serve_in_background(executor, server);

    let clients: Vec<_> = (0..N)
        .map(|i| thread::spawn(move || submit_payload(addr, &payload_returning(100 + i)).unwrap()))
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    let mut codes = BTreeSet::new();
    let mut ids = BTreeSet::new();
    for _ in 0..N {
        let report = reports.recv_timeout(REPORT_TIMEOUT).unwrap();
        codes.insert(report.exit_code);
        ids.insert(report.id);
    }
    assert_eq!(codes, (100..100 + N).collect());
    assert_eq!(ids.len(), N as usize);

    assert!(PayloadExecutor::shutdown(&handle));
    let summary = serving.join().unwrap();
    assert_eq!(summary.stop, StopReason::AcceptFailed);
    assert_eq!(summary.accepted, N as u64);
    assert_eq!(summary.spawned, N as u64);
    assert_eq!(summary.failed, 0);
}

#[test]
fn accept_continues_while_payload_runs() {
    let server = new_server();
    let addr = loopback(&server);
    let handle = server.handle();
    let (executor, reports) = reporting_executor(MemoryMode::Emulated);
    let serving = serve_in_background(executor, server);

    let slow = Duration::from_secs(2);
    let start = Instant::now();
    submit_payload(addr, &payload_sleeping(slow, 1)).unwrap();
    submit_payload(addr, &payload_returning(2)).unwrap();

    let first = reports.recv_timeout(REPORT_TIMEOUT).unwrap();
    assert_eq!(first.exit_code, 2);
    assert!(start.elapsed() < slow);

    let second = reports.recv_timeout(REPORT_TIMEOUT).unwrap();
    assert_eq!(second.exit_code, 1);
    assert!(start.elapsed() >= slow);

    handle.shutdown();
    let summary = serving.join().unwrap();
    assert_eq!(summary.spawned, 2);
}

#[test]
fn empty_payload_stops_accepting() {
    let server = new_server();
    let addr = loopback(&server);
    let (executor, _reports) = reporting_executor(MemoryMode::Direct);
    let serving = serve_in_background(executor, server);

    submit_payload(addr, &[]).unwrap();
    let summary = serving.join().unwrap();

    assert_eq!(summary.stop, StopReason::PoisonPayload);
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.spawned, 0);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn invalid_payload_stops_accepting() {
    SimpleLogger::initialize_test_logger();
    let server = new_server();
    let addr = loopback(&server);
    let (executor, reports) = reporting_executor(MemoryMode::Direct);
    let serving = serve_in_background(executor, server);

    submit_payload(addr, &payload_returning(1)).unwrap();
    assert_eq!(reports.recv_timeout(REPORT_TIMEOUT).unwrap().exit_code, 1);

    let mut foreign = payload_returning(1);
    foreign[18] ^= 0xff; // e_machine
    submit_payload(addr, &foreign).unwrap();

    let summary = serving.join().unwrap();
    assert_eq!(summary.stop, StopReason::PoisonPayload);
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.spawned, 1);
    assert!(LOGGER.contains(log::Level::Info, "stopping on invalid payload"));
}

#[test]
fn unloadable_payload_is_dropped_and_serving_continues() {
    let server = new_server();
    let addr = loopback(&server);
    let handle = server.handle();
    let (executor, reports) = reporting_executor(MemoryMode::Direct);
    let serving = serve_in_background(executor, server);

    // valid, but its footprint cannot be mapped
    let huge = ElfBuilder::new()
        .entry(0x7fff_ffff_ffff_0000)
        .segment(0x7fff_ffff_ffff_0000, &[0xc3], 0x100, PF_R | PF_X)
        .build();
    submit_payload(addr, &huge).unwrap();
    submit_payload(addr, &payload_returning(3)).unwrap();
    assert_eq!(reports.recv_timeout(REPORT_TIMEOUT).unwrap().exit_code, 3);

    handle.shutdown();
    let summary = serving.join().unwrap();
    assert_eq!(summary.stop, StopReason::AcceptFailed);
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.spawned, 1);
}

#[test]
fn shutdown_from_another_thread_stops_idle_loop() {
    let server = new_server();
    let handle = server.handle();
    let (executor, _reports) = reporting_executor(MemoryMode::Direct);
    let serving = serve_in_background(executor, server);

    thread::sleep(Duration::from_millis(100));
    assert!(PayloadExecutor::shutdown(&handle));
    let summary = serving.join().unwrap();
    assert_eq!(summary.stop, StopReason::AcceptFailed);
    assert_eq!(summary.accepted, 0);
    assert!(!PayloadExecutor::shutdown(&handle));
}

#[test]
fn file_mode() {
    let (executor, reports) = reporting_executor(MemoryMode::Direct);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&payload_returning(11)).unwrap();
    assert_eq!(executor.run_file(file.path()).unwrap(), 11);
    assert_eq!(reports.recv_timeout(REPORT_TIMEOUT).unwrap().exit_code, 11);

    let mut text = tempfile::NamedTempFile::new().unwrap();
    text.write_all(b"#!/bin/sh\necho hi\n").unwrap();
    assert!(executor.run_file(text.path()).unwrap_err().is_poison());

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.elf");
    assert!(matches!(
        executor.run_file(&missing),
        Err(LoaderError::FileOpenFailure { .. })
    ));
}
