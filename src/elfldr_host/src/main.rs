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
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use elfldr_host::{
    InputMode, LoaderConfiguration, LoaderError, MemoryMode, PayloadExecutor, PayloadServer,
    ThreadingMode,
};

/// Load and run native ELF payloads sent over TCP or read from a file.
#[derive(Parser, Debug)]
#[command(name = "elfldr", version, about)]
struct Cli {
    /// Run the ELF at this path once instead of listening for payloads
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    /// How writable and executable views of payload memory are provided
    #[arg(short, long, value_enum, default_value_t = MemoryArg::Direct)]
    memory: MemoryArg,

    /// Run one payload on the main thread, or each payload on its own thread
    #[arg(short, long, value_enum, default_value_t = ThreadingArg::None)]
    threading: ThreadingArg,

    /// TCP port payloads are submitted to
    #[arg(short, long, default_value_t = LoaderConfiguration::DEFAULT_PORT)]
    port: u16,

    /// Enable trace logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MemoryArg {
    /// Separate RW and RX mappings of one shared object
    Direct,
    /// A single RWX mapping
    Emulated,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ThreadingArg {
    /// Serve a single payload on the main thread
    None,
    /// Serve payloads until stopped, one thread each
    PerPayload,
}

impl From<MemoryArg> for MemoryMode {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Direct => MemoryMode::Direct,
            MemoryArg::Emulated => MemoryMode::Emulated,
        }
    }
}

impl From<ThreadingArg> for ThreadingMode {
    fn from(arg: ThreadingArg) -> Self {
        match arg {
            ThreadingArg::None => ThreadingMode::None,
            ThreadingArg::PerPayload => ThreadingMode::PerPayload,
        }
    }
}

impl From<Cli> for LoaderConfiguration {
    fn from(cli: Cli) -> Self {
        let input = match cli.file {
            Some(path) => InputMode::File(path),
            None => InputMode::Network,
        };
        LoaderConfiguration::new(input, cli.memory.into(), cli.threading.into(), cli.debug)
            .with_port(cli.port)
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Only a failure to bind, or a file that cannot be opened, is a process
/// failure. Everything else is an orderly end of serving.
fn run(config: &LoaderConfiguration) -> elfldr_host::Result<()> {
    let executor = PayloadExecutor::new(config.memory_mode());

    if let InputMode::File(path) = config.input_mode() {
        return match executor.run_file(path) {
            Ok(_) => Ok(()),
            Err(e @ LoaderError::FileOpenFailure { .. }) => Err(e),
            Err(e) => {
                log::error!("{} was not run: {}", path.display(), e);
                Ok(())
            }
        };
    }

    let server = PayloadServer::listen(
        config.port(),
        config.backlog(),
        config.retry_count(),
        config.retry_delay(),
    )?;

    match config.threading_mode() {
        ThreadingMode::None => {
            if let Err(e) = executor.run_once(server) {
                log::error!("payload was not run: {}", e);
            }
        }
        ThreadingMode::PerPayload => {
            let summary = executor.serve_forever(server);
            log::info!(
                "served {} payloads ({} started, {} failed), stopped: {:?}",
                summary.accepted,
                summary.spawned,
                summary.failed,
                summary.stop
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let config = LoaderConfiguration::from(Cli::parse());
    init_logging(config.debug());

    if let Err(e) = elfldr_host::signal_handlers::setup_signal_handlers() {
        log::warn!("could not set up signal handlers: {}", e);
    }

    log::debug!("starting with {:?}", config);
    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
