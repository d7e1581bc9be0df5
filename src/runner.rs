// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs a build from the command line, pretty-printing its configuration,
//! its prerequisites, and the progress of each phase.

use std::{
    cell::Cell,
    io::{BufRead, Write},
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use anyhow::Context;
use camino::Utf8Path;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use tracing::{debug, info};

use crate::{
    app::BuildArgs,
    compress::Compressor,
    config::{
        self, AccelerationMode, BuildConfiguration, BuildPaths, DiskFormat,
    },
    disk_tool::QemuImg,
    emulator::QemuLauncher,
    orchestrator::{Orchestrator, Phase, PhaseOutcome, SkipFlags, Toolbox},
    prereqs, report,
    ui::{Acknowledgment, Ui},
};

const PROGRESS_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Reads the operator's input lines on a helper thread, so that the build can
/// wait for a line and for a guest process at the same time. The channel
/// disconnects when stdin closes.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!("operator input closed");
    });

    rx
}

/// Discards lines typed before a question was asked.
fn drain(input: &Receiver<String>) {
    while let Ok(line) = input.try_recv() {
        debug!(%line, "discarding stale operator input");
    }
}

/// Parses a yes/no answer. An empty answer takes the default.
fn parse_answer(line: &str, default: bool) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Shows one spinner per phase and talks to the operator through the
/// terminal.
pub struct ProgressUi {
    multi: MultiProgress,
    bars: Vec<ProgressBar>,
    current: Cell<Option<Phase>>,

    /// Lines typed by the operator. `None` when nobody is at the console.
    input: Option<Receiver<String>>,
}

impl ProgressUi {
    fn new(input: Option<Receiver<String>>) -> Self {
        let multi = if input.is_some() {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let bars = Phase::PIPELINE
            .iter()
            .map(|phase| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_message(phase.label());
                bar.set_style(
                    ProgressStyle::with_template("  {msg:.dim}").unwrap(),
                );
                bar.tick();
                bar
            })
            .collect();

        Self { multi, bars, current: Cell::new(None), input }
    }

    fn bar(&self, phase: Phase) -> Option<&ProgressBar> {
        Phase::PIPELINE
            .iter()
            .position(|p| *p == phase)
            .map(|i| &self.bars[i])
    }

    fn interactive(&self) -> bool {
        self.input.is_some()
    }
}

impl Ui for ProgressUi {
    fn phase_started(&self, phase: Phase) {
        self.current.set(Some(phase));
        if let Some(bar) = self.bar(phase) {
            bar.set_style(ProgressStyle::default_spinner());
            bar.set_message(phase.label());
            bar.enable_steady_tick(PROGRESS_TICK_INTERVAL);
        }

        if !self.interactive() {
            println!("{} {}", "==>".bold(), phase.label());
        }
    }

    fn phase_finished(&self, phase: Phase, outcome: PhaseOutcome) {
        self.current.set(None);
        let (template, message) = match outcome {
            PhaseOutcome::Completed => {
                ("✓ {msg:.green}", phase.label().to_string())
            }
            PhaseOutcome::Skipped => {
                ("- {msg:.dim}", format!("{} (skipped)", phase.label()))
            }
            PhaseOutcome::Failed => {
                ("⚠ {msg:.bold.red}", phase.label().to_string())
            }
        };

        if let Some(bar) = self.bar(phase) {
            bar.set_message(message.clone());
            bar.set_style(ProgressStyle::with_template(template).unwrap());
            bar.finish();
        }

        if !self.interactive() {
            let mark = template.split_whitespace().next().unwrap_or_default();
            println!("{mark} {message}");
        }
    }

    fn set_substep(&self, substep: &str) {
        debug!(substep, "progress");
        let Some(phase) = self.current.get() else {
            return;
        };

        if let Some(bar) = self.bar(phase) {
            bar.set_message(format!("{}: {}", phase.label(), substep));
        }
    }

    fn confirm(&self, question: &str, default: bool) -> bool {
        let Some(input) = &self.input else {
            info!(question, "no operator available; answering no");
            return false;
        };

        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let answer = self.multi.suspend(|| {
            drain(input);
            loop {
                print!("{} {hint} ", question.bold());
                if std::io::stdout().flush().is_err() {
                    return false;
                }

                let Ok(line) = input.recv() else {
                    println!();
                    return false;
                };

                match parse_answer(&line, default) {
                    Some(answer) => return answer,
                    None => println!("Please answer 'y' or 'n'."),
                }
            }
        });

        info!(question, answer, "operator answered");
        answer
    }

    fn acknowledgment(&self, prompt: &str) -> Acknowledgment<'_> {
        let Some(input) = &self.input else {
            return Acknowledgment::never();
        };

        drain(input);
        self.multi.suspend(|| println!("{}", prompt.bold()));
        if let Some(phase) = self.current.get() {
            self.set_substep(&format!(
                "waiting for operator ({})",
                phase.label()
            ));
        }

        Acknowledgment::from_receiver(input)
    }
}

fn row(w: &mut dyn Write, label: &str, value: String) -> std::io::Result<()> {
    writeln!(w, "  {:20} {}", format!("{label}:").bold(), value)
}

fn print_configuration(
    w: &mut dyn Write,
    config: &BuildConfiguration,
    paths: &BuildPaths,
    skip: SkipFlags,
    output_formats: &[DiskFormat],
) -> std::io::Result<()> {
    writeln!(w, "{}", "Build configuration:".bold())?;

    let guest_phases = Phase::GUEST_PHASES
        .iter()
        .map(|p| {
            if skip.skips(*p) {
                format!("{} (skipped)", p.slug())
            } else {
                p.slug().to_string()
            }
        })
        .join(", ");

    let compression = if config.compression.enabled {
        let overrides = config
            .compression
            .per_format
            .iter()
            .map(|(format, scheme)| format!("{format}: {scheme}"))
            .join(", ");
        if overrides.is_empty() {
            config.compression.scheme.clone()
        } else {
            format!("{} ({overrides})", config.compression.scheme)
        }
    } else {
        "disabled".to_string()
    };

    row(w, "VM name", paths.vm_name().to_string())?;
    row(w, "Working directory", paths.work_dir().to_string())?;
    row(
        w,
        "Working disk",
        format!(
            "{} ({}, {})",
            paths.working_disk(),
            config.disk_format,
            config.disk_size_spec
        ),
    )?;
    row(w, "Memory", format!("{} MiB", config.memory_mebibytes))?;
    row(w, "CPUs", config.cpu_count.to_string())?;
    row(
        w,
        "Acceleration",
        match config.acceleration_mode {
            AccelerationMode::Hardware => "hardware (KVM)".to_string(),
            AccelerationMode::Software => "software (TCG)".to_string(),
        },
    )?;
    row(w, "Installation media", paths.install_media().to_string())?;
    row(w, "Driver media", paths.driver_media().to_string())?;
    row(w, "Emulator", paths.emulator().to_string())?;
    row(w, "Disk image tool", paths.disk_tool().to_string())?;
    row(w, "Guest phases", guest_phases)?;
    row(
        w,
        "Output formats",
        if output_formats.is_empty() {
            "none".to_string()
        } else {
            output_formats.iter().join(", ")
        },
    )?;
    row(w, "Compression", compression)?;

    Ok(())
}

/// Runs a complete build, pretty-printing its progress and a final report.
/// Returns an error if any phase or requested output failed.
pub fn run_build(args: &BuildArgs, interactive: bool) -> anyhow::Result<()> {
    let config = config::load(&args.config).with_context(|| {
        format!("loading build configuration from {}", args.config)
    })?;

    let output_formats: Vec<DiskFormat> = if args.output_formats.is_empty() {
        config.output_formats.clone()
    } else {
        args.output_formats.iter().copied().unique().collect()
    };

    let skip = SkipFlags::from(&args.skip);
    let paths = BuildPaths::new(&args.work_dir, &args.name, &config);
    info!(
        vm = %args.name,
        work_dir = %args.work_dir,
        ?skip,
        ?output_formats,
        "starting build"
    );

    print_configuration(
        &mut std::io::stdout(),
        &config,
        &paths,
        skip,
        &output_formats,
    )?;
    println!();

    let compressor = Compressor::new();
    let checked =
        prereqs::validate(&config, &paths, skip, &output_formats, &compressor);
    match checked {
        Ok(warnings) => {
            if !warnings.is_empty() {
                println!("{}", "Warnings:".bold());
                for warning in &warnings {
                    println!("  {warning}");
                }
                println!();
            }
        }
        Err(e) => {
            println!("{}", "Some prerequisites were not satisfied:".bold());
            for unsatisfied in &e.errors {
                println!("  {unsatisfied}");
            }
            println!();
            return Err(e).context("checking build prerequisites");
        }
    }

    let input = interactive.then(spawn_stdin_reader);
    if let Some(input) = &input {
        println!("Press Enter to continue or CTRL-C to cancel.");
        std::io::stdout().flush()?;
        if input.recv().is_err() {
            anyhow::bail!("operator input closed before the build started");
        }
    }

    let ui = ProgressUi::new(input);
    let disk_tool = QemuImg::new(paths.disk_tool().to_owned());
    let outcome = Orchestrator::new(
        &config,
        &paths,
        skip,
        output_formats,
        Toolbox {
            disk_tool: &disk_tool,
            launcher: &QemuLauncher,
            compressor: &compressor,
        },
    )
    .run(&ui);

    println!();
    println!("{}", report::render(&outcome.state, &config, &outcome.outputs));

    if let Some(e) = outcome.error {
        return Err(e.into());
    }

    let failed = outcome.outputs.iter().filter(|o| o.failed()).count();
    if failed > 0 {
        anyhow::bail!("{failed} requested output(s) failed");
    }

    Ok(())
}

/// Writes an example configuration document to `path`.
pub fn write_config(path: &Utf8Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{path} already exists; pass --force to overwrite it");
    }

    config::save(&BuildConfiguration::example(), path)?;
    println!("Wrote an example build configuration to {path}");
    Ok(())
}

/// Loads and validates a configuration, then prints it with every default
/// filled in.
pub fn check_config(path: &Utf8Path) -> anyhow::Result<()> {
    let config = config::load(path)?;
    println!("{}", config.to_json()?);
    Ok(())
}
