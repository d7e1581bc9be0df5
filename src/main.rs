// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! wimbake: builds generalized Windows disk images by driving QEMU through
//! installation, configuration, and sysprep, then converting the result into
//! the formats cloud platforms import.

use std::{fs::OpenOptions, sync::Mutex};

use anyhow::Context;
use app::{App, Command};
use camino::Utf8Path;
use clap::Parser;
use tracing_subscriber::EnvFilter;

pub mod app;
pub mod compress;
pub mod config;
pub mod convert;
pub mod disk_tool;
pub mod emulator;
pub mod orchestrator;
pub mod prereqs;
pub mod process;
pub mod provision;
pub mod report;
pub mod runner;
pub mod ui;
pub mod util;

const LOG_FILE_NAME: &str = "wimbake.log";

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Sends diagnostics to a log file in the build's work directory so they
/// don't interfere with the progress display.
fn init_build_logging(work_dir: &Utf8Path) -> anyhow::Result<()> {
    let logs = work_dir.join("logs");
    std::fs::create_dir_all(&logs)
        .with_context(|| format!("creating log directory {logs}"))?;

    let path = logs.join(LOG_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {path}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}

fn init_console_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let interactive = match app.interactive {
        Some(val) => val,
        None => atty::is(atty::Stream::Stdout),
    };

    match &app.command {
        Command::Build { args } => {
            init_build_logging(&args.work_dir)?;
            runner::run_build(args, interactive)
        }
        Command::WriteConfig { path, force } => {
            init_console_logging();
            runner::write_config(path, *force)
        }
        Command::CheckConfig { config } => {
            init_console_logging();
            runner::check_config(config)
        }
    }
}
