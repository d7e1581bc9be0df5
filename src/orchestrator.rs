// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The build-phase state machine.
//!
//! A build moves strictly forward through [`Phase::PIPELINE`]. The guest
//! phases (install, configure, generalize, test boot) can each be skipped by
//! a flag given when the build starts, and the operator is also asked at run
//! time whether to test boot. A failed phase ends the build in
//! [`Phase::Failed`].
//!
//! Nothing is ever retried. Every guest phase mutates the working disk, so
//! rerunning a phase that failed partway through would start from whatever
//! state the failure left behind. Recovering means starting a new build,
//! optionally reusing the working disk and skipping the phases it already
//! went through.

use std::{
    fmt, io,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    compress::{CompressedArtifact, CompressionError, Compressor},
    config::{BuildConfiguration, BuildPaths, DiskFormat},
    convert::{self, ConversionError, ConversionResult},
    disk_tool::DiskImageTool,
    emulator::{self, Launcher, WaitPolicy},
    process::{ProcessExit, ProcessHandle, ProcessState, WaitOutcome},
    provision::{self, DiskCreateError},
    ui::Ui,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Provisioning,
    Installing,
    Configuring,
    Generalizing,
    TestBooting,
    Converting,
    Compressing,
    Done,
    Failed,
}

impl Phase {
    /// Every phase that does work, in execution order.
    pub const PIPELINE: [Phase; 7] = [
        Phase::Provisioning,
        Phase::Installing,
        Phase::Configuring,
        Phase::Generalizing,
        Phase::TestBooting,
        Phase::Converting,
        Phase::Compressing,
    ];

    pub const GUEST_PHASES: [Phase; 4] = [
        Phase::Installing,
        Phase::Configuring,
        Phase::Generalizing,
        Phase::TestBooting,
    ];

    /// A description for progress output.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Provisioning => "provision working disk",
            Phase::Installing => "install Windows",
            Phase::Configuring => "configure guest",
            Phase::Generalizing => "generalize guest",
            Phase::TestBooting => "test boot",
            Phase::Converting => "convert disk images",
            Phase::Compressing => "compress disk images",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    /// A short name for file names and logs.
    pub fn slug(self) -> &'static str {
        match self {
            Phase::Provisioning => "provision",
            Phase::Installing => "install",
            Phase::Configuring => "configure",
            Phase::Generalizing => "generalize",
            Phase::TestBooting => "test-boot",
            Phase::Converting => "convert",
            Phase::Compressing => "compress",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Skipped,

    /// The phase failed. For the converting and compressing phases this
    /// means at least one output failed; the build still continues.
    Failed,
}

/// Guest phases the operator asked to skip when starting the build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipFlags {
    pub install: bool,
    pub configure: bool,
    pub generalize: bool,
    pub test_boot: bool,
}

impl SkipFlags {
    pub fn skips(&self, phase: Phase) -> bool {
        match phase {
            Phase::Installing => self.install,
            Phase::Configuring => self.configure,
            Phase::Generalizing => self.generalize,
            Phase::TestBooting => self.test_boot,
            _ => false,
        }
    }

    /// True if at least one guest phase might boot the emulator.
    pub fn runs_any_guest_phase(&self) -> bool {
        Phase::GUEST_PHASES.iter().any(|p| !self.skips(*p))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub started: Instant,
    pub elapsed: Duration,
}

/// Where a build is and where it has been.
#[derive(Clone, Debug)]
pub struct BuildState {
    pub current_phase: Phase,
    pub vm_name: String,
    pub working_disk_path: Utf8PathBuf,

    /// Whether provisioning kept a disk left behind by an earlier build.
    pub reused_working_disk: bool,
    pub started_at: Instant,
    pub records: Vec<PhaseRecord>,
}

impl BuildState {
    pub fn new(vm_name: &str, working_disk_path: Utf8PathBuf) -> Self {
        Self {
            current_phase: Phase::Provisioning,
            vm_name: vm_name.to_owned(),
            working_disk_path,
            reused_working_disk: false,
            started_at: Instant::now(),
            records: Vec::new(),
        }
    }

    /// Moves to `next`.
    ///
    /// # Panics
    ///
    /// Panics if `next` doesn't come after the current phase, or if the
    /// build already finished.
    pub fn advance(&mut self, next: Phase) {
        assert!(
            !self.current_phase.is_terminal() && next > self.current_phase,
            "illegal phase transition from {} to {}",
            self.current_phase,
            next
        );
        self.current_phase = next;
    }

    fn record(
        &mut self,
        phase: Phase,
        outcome: PhaseOutcome,
        started: Instant,
    ) {
        self.records.push(PhaseRecord {
            phase,
            outcome,
            started,
            elapsed: started.elapsed(),
        });
    }

    fn fail(&mut self, phase: Phase, started: Instant) {
        self.record(phase, PhaseOutcome::Failed, started);
        self.advance(Phase::Failed);
    }

    /// The last phase that ran to completion.
    pub fn last_completed(&self) -> Option<Phase> {
        self.records
            .iter()
            .rev()
            .find(|r| r.outcome == PhaseOutcome::Completed)
            .map(|r| r.phase)
    }

    /// The phases that actually ran, in order.
    pub fn executed(&self) -> Vec<Phase> {
        self.records
            .iter()
            .filter(|r| r.outcome != PhaseOutcome::Skipped)
            .map(|r| r.phase)
            .collect()
    }

    /// Time from the start of the first phase to the end of the last one.
    pub fn elapsed(&self) -> Duration {
        let Some(first) = self.records.first() else {
            return Duration::ZERO;
        };

        self.records
            .iter()
            .map(|r| {
                (r.started + r.elapsed).saturating_duration_since(first.started)
            })
            .max()
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("working disk {0} no longer exists")]
    WorkingDiskMissing(Utf8PathBuf),

    #[error("launching the emulator")]
    Launch(#[source] io::Error),

    #[error("supervising the emulator")]
    Supervise(#[source] io::Error),

    #[error("the emulator exited with {exit} (console output in {transcript})")]
    Subprocess { exit: ProcessExit, transcript: Utf8PathBuf },

    #[error("operator input closed before the phase was acknowledged")]
    Cancelled,
}

fn describe_last_completed(phase: &Option<Phase>) -> String {
    match phase {
        Some(phase) => format!("last successful phase: {phase}"),
        None => "no phase completed".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("provisioning the working disk failed")]
    Provision(#[source] DiskCreateError),

    #[error(
        "phase {phase} failed ({})",
        describe_last_completed(.last_completed)
    )]
    Phase {
        phase: Phase,
        last_completed: Option<Phase>,
        #[source]
        source: PhaseError,
    },
}

/// What happened to one requested output format.
#[derive(Debug)]
pub struct OutputRecord {
    pub format: DiskFormat,
    pub conversion: Result<ConversionResult, ConversionError>,

    /// `None` if compression was disabled or the conversion failed.
    pub compression: Option<Result<CompressedArtifact, CompressionError>>,
}

impl OutputRecord {
    pub fn failed(&self) -> bool {
        self.conversion.is_err() || matches!(self.compression, Some(Err(_)))
    }
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub state: BuildState,
    pub outputs: Vec<OutputRecord>,
    pub error: Option<BuildError>,
}

impl BuildOutcome {
    /// True if every phase and every requested output succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.outputs.iter().any(OutputRecord::failed)
    }
}

/// The external tools a build drives.
pub struct Toolbox<'a> {
    pub disk_tool: &'a dyn DiskImageTool,
    pub launcher: &'a dyn Launcher,
    pub compressor: &'a Compressor,
}

pub struct Orchestrator<'a> {
    config: &'a BuildConfiguration,
    paths: &'a BuildPaths,
    skip: SkipFlags,
    output_formats: Vec<DiskFormat>,
    tools: Toolbox<'a>,
    poll_interval: Duration,
    shutdown_grace: Duration,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a BuildConfiguration,
        paths: &'a BuildPaths,
        skip: SkipFlags,
        output_formats: Vec<DiskFormat>,
        tools: Toolbox<'a>,
    ) -> Self {
        Self {
            config,
            paths,
            skip,
            output_formats,
            tools,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_grace: Duration::from_secs(
                config.emulator.shutdown_grace_seconds,
            ),
        }
    }

    /// Overrides how often guests are polled and how long they get to power
    /// off after a shutdown request.
    pub fn with_timing(
        mut self,
        poll_interval: Duration,
        grace: Duration,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.shutdown_grace = grace;
        self
    }

    /// Runs the whole pipeline.
    pub fn run(&self, ui: &dyn Ui) -> BuildOutcome {
        let mut state =
            BuildState::new(self.paths.vm_name(), self.paths.working_disk());
        let mut outputs = Vec::new();

        let error = self.run_phases(&mut state, &mut outputs, ui).err();
        if let Some(e) = &error {
            error!(error = %e, "build failed");
        } else {
            state.advance(Phase::Done);
            info!(
                executed = ?state.executed(),
                elapsed = ?state.elapsed(),
                "build finished"
            );
        }

        BuildOutcome { state, outputs, error }
    }

    fn run_phases(
        &self,
        state: &mut BuildState,
        outputs: &mut Vec<OutputRecord>,
        ui: &dyn Ui,
    ) -> Result<(), BuildError> {
        let started = Instant::now();
        ui.phase_started(Phase::Provisioning);
        match provision::provision(
            self.paths,
            self.config,
            self.tools.disk_tool,
            ui,
        ) {
            Ok(disk) => {
                state.working_disk_path = disk.path;
                state.reused_working_disk = disk.reused;
                self.finish(
                    state,
                    Phase::Provisioning,
                    PhaseOutcome::Completed,
                    started,
                    ui,
                );
            }
            Err(e) => {
                state.fail(Phase::Provisioning, started);
                ui.phase_finished(Phase::Provisioning, PhaseOutcome::Failed);
                return Err(BuildError::Provision(e));
            }
        }

        for phase in Phase::GUEST_PHASES {
            state.advance(phase);
            let started = Instant::now();

            if self.skip.skips(phase) {
                info!(%phase, "skipped by request");
                self.finish(state, phase, PhaseOutcome::Skipped, started, ui);
                continue;
            }

            if phase == Phase::TestBooting
                && !ui.confirm("Boot the generalized image to test it?", true)
            {
                info!(%phase, "declined by operator");
                self.finish(state, phase, PhaseOutcome::Skipped, started, ui);
                continue;
            }

            ui.phase_started(phase);
            info!(%phase, "starting phase");
            if let Err(source) =
                self.run_guest_phase(phase, &state.working_disk_path, ui)
            {
                state.fail(phase, started);
                ui.phase_finished(phase, PhaseOutcome::Failed);
                return Err(BuildError::Phase {
                    phase,
                    last_completed: state.last_completed(),
                    source,
                });
            }
            self.finish(state, phase, PhaseOutcome::Completed, started, ui);
        }

        state.advance(Phase::Converting);
        let started = Instant::now();
        if self.output_formats.is_empty() {
            self.finish(
                state,
                Phase::Converting,
                PhaseOutcome::Skipped,
                started,
                ui,
            );
        } else {
            ui.phase_started(Phase::Converting);
            for format in &self.output_formats {
                let conversion = convert::convert(
                    &state.working_disk_path,
                    self.config.disk_format,
                    *format,
                    &self.paths.output_image(*format),
                    self.tools.disk_tool,
                    ui,
                );
                if let Err(e) = &conversion {
                    warn!(%format, error = %e, "conversion failed");
                }
                outputs.push(OutputRecord {
                    format: *format,
                    conversion,
                    compression: None,
                });
            }
            let outcome =
                outcome_of(outputs.iter().all(|o| o.conversion.is_ok()));
            self.finish(state, Phase::Converting, outcome, started, ui);
        }

        state.advance(Phase::Compressing);
        let started = Instant::now();
        let converted = outputs.iter().any(|o| o.conversion.is_ok());
        if !self.config.compression.enabled || !converted {
            self.finish(
                state,
                Phase::Compressing,
                PhaseOutcome::Skipped,
                started,
                ui,
            );
            return Ok(());
        }

        ui.phase_started(Phase::Compressing);
        for output in outputs.iter_mut() {
            let Ok(converted) = &output.conversion else {
                continue;
            };

            let scheme = self.config.compression.scheme_for(output.format);
            let compression =
                self.tools.compressor.compress(&converted.path, scheme, ui);
            if let Err(e) = &compression {
                warn!(
                    format = %output.format,
                    scheme,
                    error = %e,
                    "compression failed"
                );
            }
            output.compression = Some(compression);
        }
        let outcome = outcome_of(
            outputs.iter().all(|o| !matches!(o.compression, Some(Err(_)))),
        );
        self.finish(state, Phase::Compressing, outcome, started, ui);

        Ok(())
    }

    fn finish(
        &self,
        state: &mut BuildState,
        phase: Phase,
        outcome: PhaseOutcome,
        started: Instant,
        ui: &dyn Ui,
    ) {
        state.record(phase, outcome, started);
        ui.phase_finished(phase, outcome);
    }

    /// Boots the guest for `phase` and supervises it until the phase is over.
    fn run_guest_phase(
        &self,
        phase: Phase,
        working_disk: &Utf8Path,
        ui: &dyn Ui,
    ) -> Result<(), PhaseError> {
        if !working_disk.exists() {
            return Err(PhaseError::WorkingDiskMissing(working_disk.to_owned()));
        }

        let Some(invocation) = emulator::invocation_for(
            phase,
            self.config,
            self.paths,
            working_disk,
        ) else {
            unreachable!("{phase} does not boot a guest");
        };
        let transcript = self.paths.transcript(phase.slug());

        info!(
            %phase,
            command = invocation.command_line(),
            %transcript,
            "launching emulator"
        );
        ui.set_substep(&format!("booting guest (console log: {transcript})"));
        let process = self
            .tools
            .launcher
            .launch(&invocation)
            .map_err(PhaseError::Launch)?;
        let mut handle = ProcessHandle::new(process, self.poll_interval);

        let state = match invocation.wait_policy {
            WaitPolicy::WaitForExit => {
                ui.set_substep("waiting for the guest to power off");
                handle.wait().map_err(PhaseError::Supervise)?
            }
            WaitPolicy::WaitForExitOrOperatorSignal => {
                let ack = ui.acknowledgment(&self.acknowledgment_prompt(phase));
                let waited = handle
                    .wait_or_acknowledged(&ack)
                    .map_err(PhaseError::Supervise)?;
                match waited {
                    WaitOutcome::Exited(state) => state,
                    WaitOutcome::Acknowledged => {
                        info!(%phase, "operator acknowledged phase");
                        ui.set_substep("shutting down the guest");
                        handle
                            .shut_down(self.shutdown_grace)
                            .map_err(PhaseError::Supervise)?
                    }
                    WaitOutcome::Cancelled => {
                        handle
                            .shut_down(self.shutdown_grace)
                            .map_err(PhaseError::Supervise)?;
                        return Err(PhaseError::Cancelled);
                    }
                }
            }
        };

        match state {
            ProcessState::ExitedSuccess => Ok(()),

            // Only reachable after the operator said the phase was done.
            ProcessState::Killed => {
                warn!(%phase, "guest was killed after acknowledgment");
                Ok(())
            }

            ProcessState::ExitedFailure(exit) => {
                Err(PhaseError::Subprocess { exit, transcript })
            }

            ProcessState::Running => {
                unreachable!("supervision returned while the guest was running")
            }
        }
    }

    fn acknowledgment_prompt(&self, phase: Phase) -> String {
        match phase {
            Phase::Configuring => {
                let forwards = self
                    .config
                    .network
                    .forwards
                    .iter()
                    .map(|f| format!("localhost:{}", f.host_port))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Configure the guest (forwarded to {forwards}), then press \
                     Enter to shut it down."
                )
            }
            _ => "Press Enter when the test boot looks good to shut it down."
                .to_string(),
        }
    }
}

fn outcome_of(all_succeeded: bool) -> PhaseOutcome {
    if all_succeeded {
        PhaseOutcome::Completed
    } else {
        PhaseOutcome::Failed
    }
}


#[cfg(test)]
mod test {
    use super::{testing::*, *};
    use crate::{
        disk_tool::testing::DiskToolCall,
        emulator::testing::{FakeGuest, FakeLauncher},
        ui::testing::ScriptedUi,
    };

    fn config_with_outputs(formats: &[DiskFormat]) -> BuildConfiguration {
        let mut config = BuildConfiguration::example();
        config.output_formats = formats.to_vec();
        config
    }

    #[test]
    fn phase_ordering_over_every_skip_combination() {
        for bits in 0..16u8 {
            let skip = SkipFlags {
                install: bits & 1 != 0,
                configure: bits & 2 != 0,
                generalize: bits & 4 != 0,
                test_boot: bits & 8 != 0,
            };
            let f = Fixture::new(config_with_outputs(&[DiskFormat::Raw]));
            let outcome = f.run(skip, &ScriptedUi::default());

            let guests: Vec<Phase> = Phase::GUEST_PHASES
                .into_iter()
                .filter(|p| !skip.skips(*p))
                .collect();
            let mut expected = vec![Phase::Provisioning];
            expected.extend(&guests);
            expected.push(Phase::Converting);

            assert_eq!(outcome.state.executed(), expected, "{skip:?}");
            assert_eq!(outcome.state.current_phase, Phase::Done);
            assert_eq!(
                f.launcher.launched_slugs(),
                guests.iter().map(|p| p.slug()).collect::<Vec<_>>(),
                "{skip:?}"
            );

            // Every pipeline phase is accounted for, in order.
            let recorded: Vec<Phase> =
                outcome.state.records.iter().map(|r| r.phase).collect();
            assert_eq!(recorded, Phase::PIPELINE);
            assert!(outcome.succeeded());
        }
    }

    #[test]
    fn provision_and_convert_only() {
        let f = Fixture::new(config_with_outputs(&[DiskFormat::Raw]));
        let ui = ScriptedUi::default();
        let outcome = f.run(SKIP_ALL, &ui);

        assert_eq!(
            *ui.started.borrow(),
            [Phase::Provisioning, Phase::Converting]
        );
        assert_eq!(
            ui.finished
                .borrow()
                .iter()
                .filter(|(_, o)| *o == PhaseOutcome::Skipped)
                .count(),
            5
        );
        assert_eq!(
            f.tool.creates(),
            [DiskToolCall::Create {
                format: DiskFormat::Qcow2,
                size: "150G".to_string(),
                path: f.paths.working_disk(),
            }]
        );

        let converts = f.tool.converts();
        assert_eq!(converts.len(), 1);
        assert!(matches!(
            &converts[0],
            DiskToolCall::Convert {
                from: DiskFormat::Qcow2,
                to: DiskFormat::Raw,
                ..
            }
        ));

        assert_eq!(outcome.outputs.len(), 1);
        let result = outcome.outputs[0].conversion.as_ref().unwrap();
        assert_eq!(result.path, f.paths.output_image(DiskFormat::Raw));
        assert!(outcome.outputs[0].compression.is_none());
        assert!(f.launcher.launched.borrow().is_empty());
        assert!(outcome.succeeded());
    }

    #[test]
    fn declined_recreation_reuses_existing_disk() {
        let f = Fixture::new(config_with_outputs(&[]));
        std::fs::write(f.paths.working_disk(), b"installed windows").unwrap();

        let ui = ScriptedUi::default().answering(&[false]);
        let outcome = f.run(SKIP_ALL, &ui);

        assert!(f.tool.creates().is_empty());
        assert_eq!(outcome.state.working_disk_path, f.paths.working_disk());
        assert!(outcome.state.reused_working_disk);
        assert_eq!(outcome.state.current_phase, Phase::Done);
    }

    #[test]
    fn install_failure_stops_the_pipeline() {
        let mut f = Fixture::new(config_with_outputs(&[DiskFormat::Vhd]));
        f.config.compression.enabled = true;
        f.launcher = FakeLauncher::with_guests(&[FakeGuest::failing(1)]);

        let ui = ScriptedUi::default();
        let outcome = f.run(SkipFlags::default(), &ui);

        assert_eq!(outcome.state.current_phase, Phase::Failed);
        assert_eq!(
            outcome.state.executed(),
            [Phase::Provisioning, Phase::Installing]
        );
        assert_eq!(f.launcher.launched_slugs(), ["install"]);
        assert!(f.tool.converts().is_empty());
        assert!(outcome.outputs.is_empty());
        assert!(!outcome.succeeded());
        assert!(ui.questions.borrow().is_empty());

        match outcome.error {
            Some(BuildError::Phase {
                phase: Phase::Installing,
                last_completed: Some(Phase::Provisioning),
                source: PhaseError::Subprocess { exit, transcript },
            }) => {
                assert_eq!(exit.code(), Some(1));
                assert_eq!(transcript, f.paths.transcript("install"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn one_compression_failure_does_not_block_the_other() {
        let mut f = Fixture::new(config_with_outputs(&[
            DiskFormat::Raw,
            DiskFormat::Vhd,
        ]));
        f.config.compression.enabled = true;
        f.config
            .compression
            .per_format
            .insert("vhd".to_string(), "lzma".to_string());

        let outcome = f.run(SKIP_ALL, &ScriptedUi::default());
        assert_eq!(outcome.state.current_phase, Phase::Done);
        assert_eq!(outcome.outputs.len(), 2);

        let raw = outcome.outputs[0].compression.as_ref().unwrap();
        let artifact = raw.as_ref().unwrap();
        assert_eq!(
            artifact.path,
            format!("{}.gz", f.paths.output_image(DiskFormat::Raw))
        );
        assert!(artifact.path.exists());

        let vhd = outcome.outputs[1].compression.as_ref().unwrap();
        assert!(matches!(
            vhd,
            Err(CompressionError::UnsupportedScheme(name)) if name == "lzma"
        ));

        let compressing = outcome.state.records.last().unwrap();
        assert_eq!(compressing.phase, Phase::Compressing);
        assert_eq!(compressing.outcome, PhaseOutcome::Failed);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn conversions_are_independent() {
        let mut f = Fixture::new(config_with_outputs(&[
            DiskFormat::Vhd,
            DiskFormat::Raw,
        ]));
        f.tool.fail_convert_to.insert(DiskFormat::Vhd);

        let outcome = f.run(SKIP_ALL, &ScriptedUi::default());
        assert_eq!(f.tool.converts().len(), 2);
        assert!(outcome.outputs[0].conversion.is_err());
        assert!(outcome.outputs[1].conversion.is_ok());
        assert_eq!(outcome.state.current_phase, Phase::Done);
        assert!(outcome.error.is_none());
        assert!(!outcome.succeeded());
    }

    #[test]
    fn acknowledged_phase_powers_the_guest_off() {
        let mut f = Fixture::new(config_with_outputs(&[]));
        f.launcher = FakeLauncher::with_guests(&[FakeGuest::interactive()]);
        let skip = SkipFlags { configure: false, ..SKIP_ALL };

        let outcome = f.run(skip, &ScriptedUi::acknowledging());
        assert_eq!(
            outcome.state.executed(),
            [Phase::Provisioning, Phase::Configuring]
        );
        assert_eq!(outcome.state.current_phase, Phase::Done);
        assert!(outcome.succeeded());
    }

    #[test]
    fn guest_ignoring_power_off_is_killed_after_acknowledgment() {
        let mut f = Fixture::new(config_with_outputs(&[]));
        f.launcher = FakeLauncher::with_guests(&[FakeGuest {
            shutdown_takes: None,
            ..FakeGuest::interactive()
        }]);
        let skip = SkipFlags { test_boot: false, ..SKIP_ALL };

        let outcome = f.run(skip, &ScriptedUi::acknowledging());
        assert_eq!(
            outcome.state.executed(),
            [Phase::Provisioning, Phase::TestBooting]
        );
        assert!(outcome.succeeded());
    }

    #[test]
    fn operator_can_decline_the_test_boot() {
        let f = Fixture::new(config_with_outputs(&[]));
        let skip = SkipFlags { test_boot: false, ..SKIP_ALL };

        let ui = ScriptedUi::default().answering(&[false]);
        let outcome = f.run(skip, &ui);

        assert_eq!(ui.questions.borrow().len(), 1);
        assert!(f.launcher.launched.borrow().is_empty());
        assert_eq!(outcome.state.executed(), [Phase::Provisioning]);
        assert!(outcome.succeeded());
    }

    #[test]
    fn missing_working_disk_fails_fast() {
        let f = Fixture::new(config_with_outputs(&[]));
        let missing = f.paths.working_disk();
        let err = f
            .orchestrator(SkipFlags::default())
            .run_guest_phase(
                Phase::Generalizing,
                &missing,
                &ScriptedUi::default(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            PhaseError::WorkingDiskMissing(path) if path == missing
        ));
        assert!(f.launcher.launched.borrow().is_empty());
    }

    #[test]
    fn launch_failure_fails_the_phase() {
        let mut f = Fixture::new(config_with_outputs(&[]));
        f.launcher.fail_launch = true;

        let outcome = f.run(SkipFlags::default(), &ScriptedUi::default());
        assert!(matches!(
            outcome.error,
            Some(BuildError::Phase {
                phase: Phase::Installing,
                source: PhaseError::Launch(_),
                ..
            })
        ));
    }

    #[test]
    fn provisioning_failure_is_reported() {
        let mut f = Fixture::new(config_with_outputs(&[DiskFormat::Raw]));
        f.tool.fail_create = true;

        let outcome = f.run(SKIP_ALL, &ScriptedUi::default());
        assert_eq!(outcome.state.current_phase, Phase::Failed);
        assert_eq!(outcome.state.last_completed(), None);
        assert!(matches!(outcome.error, Some(BuildError::Provision(_))));
    }

    #[test]
    fn failures_name_the_last_successful_phase() {
        let err = BuildError::Phase {
            phase: Phase::Generalizing,
            last_completed: Some(Phase::Configuring),
            source: PhaseError::Cancelled,
        };
        assert_eq!(
            err.to_string(),
            "phase generalize failed (last successful phase: configure)"
        );
    }

    #[test]
    #[should_panic(expected = "illegal phase transition")]
    fn backwards_transitions_panic() {
        let mut state = BuildState::new("win", "win.qcow2".into());
        state.advance(Phase::Generalizing);
        state.advance(Phase::Installing);
    }
}
