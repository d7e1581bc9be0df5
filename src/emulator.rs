// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builds QEMU command lines for each guest phase and launches them.
//!
//! Every guest phase boots the same working disk. What differs between
//! phases is the removable media attached, the boot order, and whether the
//! guest's remote-access port is forwarded to the host:
//!
//! | Phase        | Install media | Driver media | Boot order  | Forwarding |
//! |--------------|---------------|--------------|-------------|------------|
//! | Installing   | yes           | yes          | CD, disk    | none       |
//! | Configuring  | no            | yes          | disk        | yes        |
//! | Generalizing | no            | no           | disk        | yes        |
//! | TestBooting  | no            | no           | disk        | none       |
//!
//! Test boots run with `-snapshot` so that booting the generalized image
//! (which starts Windows' out-of-box experience) doesn't write to the disk
//! that is about to be converted.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    net::{SocketAddr, TcpStream},
    process::{Child, Command, Stdio},
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;

use crate::{
    config::{AccelerationMode, BuildConfiguration, BuildPaths},
    orchestrator::Phase,
    process::{GuestProcess, ProcessExit},
};

const MONITOR_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitPolicy {
    /// The guest powers itself off when the phase's work is done.
    WaitForExit,

    /// The phase needs an operator, who says when it's done.
    WaitForExitOrOperatorSignal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootOrder {
    OpticalThenDisk,
    DiskOnly,
}

impl BootOrder {
    fn qemu_order(self) -> &'static str {
        match self {
            BootOrder::OpticalThenDisk => "order=dc",
            BootOrder::DiskOnly => "order=c",
        }
    }
}

/// The devices attached to the guest during a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseDevices {
    pub install_media: bool,
    pub driver_media: bool,
    pub boot: BootOrder,
    pub forward_remote_access: bool,
    pub discard_writes: bool,
    pub wait_policy: WaitPolicy,
}

impl PhaseDevices {
    /// Returns the devices for a guest phase, or `None` if `phase` doesn't
    /// boot a guest.
    pub fn for_phase(phase: Phase) -> Option<Self> {
        let devices = match phase {
            Phase::Installing => PhaseDevices {
                install_media: true,
                driver_media: true,
                boot: BootOrder::OpticalThenDisk,
                forward_remote_access: false,
                discard_writes: false,
                wait_policy: WaitPolicy::WaitForExit,
            },
            Phase::Configuring => PhaseDevices {
                install_media: false,
                driver_media: true,
                boot: BootOrder::DiskOnly,
                forward_remote_access: true,
                discard_writes: false,
                wait_policy: WaitPolicy::WaitForExitOrOperatorSignal,
            },
            Phase::Generalizing => PhaseDevices {
                install_media: false,
                driver_media: false,
                boot: BootOrder::DiskOnly,
                forward_remote_access: true,
                discard_writes: false,
                wait_policy: WaitPolicy::WaitForExit,
            },
            Phase::TestBooting => PhaseDevices {
                install_media: false,
                driver_media: false,
                boot: BootOrder::DiskOnly,
                forward_remote_access: false,
                discard_writes: true,
                wait_policy: WaitPolicy::WaitForExitOrOperatorSignal,
            },
            _ => return None,
        };

        Some(devices)
    }
}

/// One launch of an external program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubprocessInvocation {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,

    /// Where to write the program's console output.
    pub transcript: Option<Utf8PathBuf>,
    pub wait_policy: WaitPolicy,

    /// The localhost port of the QEMU monitor, if one was requested.
    pub monitor_port: Option<u16>,
}

/// QEMU splits option values on commas; a literal comma is written twice.
fn escape(path: &Utf8Path) -> String {
    path.as_str().replace(',', ",,")
}

struct Drive<'a> {
    file: &'a Utf8Path,
    format: &'static str,
    interface: &'static str,
    index: u32,
    cache: Option<&'static str>,
    cdrom: bool,
}

impl Drive<'_> {
    fn to_arg(&self) -> String {
        let mut arg = format!(
            "file={},format={},if={},index={}",
            escape(self.file),
            self.format,
            self.interface,
            self.index
        );

        if self.cdrom {
            arg.push_str(",media=cdrom");
        }

        if let Some(cache) = self.cache {
            arg.push_str(",cache=");
            arg.push_str(cache);
        }

        arg
    }
}

#[derive(Default)]
struct QemuArgs(Vec<String>);

impl QemuArgs {
    fn opt(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }

    fn flag(&mut self, flag: &str) -> &mut Self {
        self.0.push(flag.to_string());
        self
    }
}

/// Assembles the emulator invocation for a guest phase. Returns `None` if
/// `phase` doesn't boot a guest.
pub fn invocation_for(
    phase: Phase,
    config: &BuildConfiguration,
    paths: &BuildPaths,
    working_disk: &Utf8Path,
) -> Option<SubprocessInvocation> {
    let devices = PhaseDevices::for_phase(phase)?;
    let emulator = &config.emulator;

    let (accel, cpu) = match config.acceleration_mode {
        AccelerationMode::Hardware => ("kvm", "host"),
        AccelerationMode::Software => ("tcg", "max"),
    };

    let mut args = QemuArgs::default();
    args.opt("-name", paths.vm_name())
        .opt("-machine", format!("q35,accel={accel}"))
        .opt("-cpu", cpu)
        .opt("-m", config.memory_mebibytes.to_string())
        .opt("-smp", config.cpu_count.to_string())
        // Windows keeps the hardware clock in local time.
        .opt("-rtc", "base=localtime")
        .opt(
            "-drive",
            Drive {
                file: working_disk,
                format: config.disk_format.qemu_name(),
                interface: emulator.disk_interface.qemu_name(),
                index: 0,
                cache: Some("writeback"),
                cdrom: false,
            }
            .to_arg(),
        );

    if devices.install_media {
        args.opt(
            "-drive",
            Drive {
                file: paths.install_media(),
                format: "raw",
                interface: "ide",
                index: 2,
                cache: None,
                cdrom: true,
            }
            .to_arg(),
        );
    }

    if devices.driver_media {
        args.opt(
            "-drive",
            Drive {
                file: paths.driver_media(),
                format: "raw",
                interface: "ide",
                index: 3,
                cache: None,
                cdrom: true,
            }
            .to_arg(),
        );
    }

    let mut netdev = "user,id=net0".to_string();
    if devices.forward_remote_access {
        for fwd in &config.network.forwards {
            netdev.push_str(&format!(
                ",hostfwd={}::{}-:{}",
                fwd.protocol, fwd.host_port, fwd.guest_port
            ));
        }
    }

    args.opt("-boot", devices.boot.qemu_order())
        .opt("-display", emulator.display.clone())
        .opt("-netdev", netdev)
        .opt("-device", "e1000,netdev=net0")
        .opt(
            "-monitor",
            format!("telnet:127.0.0.1:{},server,nowait", emulator.monitor_port),
        );

    if devices.discard_writes {
        args.flag("-snapshot");
    }

    Some(SubprocessInvocation {
        program: paths.emulator().to_owned(),
        args: args.0,
        transcript: Some(paths.transcript(phase.slug())),
        wait_policy: devices.wait_policy,
        monitor_port: Some(emulator.monitor_port),
    })
}

impl SubprocessInvocation {
    /// The invocation as a shell-like command line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .join(" ")
    }
}

/// Starts emulator processes.
pub trait Launcher {
    fn launch(
        &self,
        invocation: &SubprocessInvocation,
    ) -> io::Result<Box<dyn GuestProcess>>;
}

/// Launches QEMU as a child process, appending its output to the
/// invocation's transcript.
pub struct QemuLauncher;

impl Launcher for QemuLauncher {
    fn launch(
        &self,
        invocation: &SubprocessInvocation,
    ) -> io::Result<Box<dyn GuestProcess>> {
        let mut cmd = Command::new(invocation.program.as_std_path());
        cmd.args(&invocation.args).stdin(Stdio::null());

        match &invocation.transcript {
            Some(transcript) => {
                if let Some(parent) = transcript.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(transcript)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd.spawn()?;
        Ok(Box::new(QemuProcess {
            child,
            monitor: invocation
                .monitor_port
                .map(|port| SocketAddr::from(([127, 0, 0, 1], port))),
        }))
    }
}

struct QemuProcess {
    child: Child,
    monitor: Option<SocketAddr>,
}

impl GuestProcess for QemuProcess {
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(ProcessExit::from))
    }

    fn wait(&mut self) -> io::Result<ProcessExit> {
        self.child.wait().map(ProcessExit::from)
    }

    fn request_shutdown(&mut self) -> io::Result<()> {
        let addr = self.monitor.ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no QEMU monitor configured")
        })?;

        // Equivalent to pressing the guest's power button; Windows shuts down
        // cleanly in response.
        let mut monitor =
            TcpStream::connect_timeout(&addr, MONITOR_CONNECT_TIMEOUT)?;
        monitor.write_all(b"system_powerdown\n")?;
        monitor.flush()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }
}
