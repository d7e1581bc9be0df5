// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of long-running guest processes.
//!
//! A [`ProcessHandle`] owns a running emulator and tracks it through the
//! states `Running`, `ExitedSuccess`, `ExitedFailure`, and `Killed`. Forced
//! termination is a race between the process exiting on its own after a
//! shutdown request and a grace period elapsing; the process is only killed
//! if the grace period wins.

use std::{
    fmt, io,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::ui::{AckStatus, Acknowledgment};

/// How a process exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    code: Option<i32>,
}

impl ProcessExit {
    pub fn from_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// A process terminated by a signal, which carries no exit code.
    #[cfg(test)]
    pub fn signaled() -> Self {
        Self { code: None }
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("termination by signal"),
        }
    }
}

/// The operations the supervisor needs from a child process.
pub trait GuestProcess {
    /// Returns the exit status if the process has exited, without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Blocks until the process exits.
    fn wait(&mut self) -> io::Result<ProcessExit>;

    /// Asks the guest to power itself off. The process may take some time to
    /// exit afterwards, or may never exit if the guest ignores the request.
    fn request_shutdown(&mut self) -> io::Result<()>;

    /// Terminates the process immediately.
    fn kill(&mut self) -> io::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    ExitedSuccess,
    ExitedFailure(ProcessExit),
    Killed,
}

impl ProcessState {
    fn from_exit(exit: ProcessExit) -> Self {
        if exit.success() {
            ProcessState::ExitedSuccess
        } else {
            ProcessState::ExitedFailure(exit)
        }
    }
}

/// The result of waiting for either a process exit or an operator's
/// acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ProcessState),
    Acknowledged,
    Cancelled,
}

pub struct ProcessHandle {
    process: Box<dyn GuestProcess>,
    state: ProcessState,
    poll_interval: Duration,
}

impl ProcessHandle {
    pub fn new(
        process: Box<dyn GuestProcess>,
        poll_interval: Duration,
    ) -> Self {
        Self { process, state: ProcessState::Running, poll_interval }
    }

    fn record(&mut self, exit: ProcessExit) -> ProcessState {
        self.state = ProcessState::from_exit(exit);
        debug!(%exit, state = ?self.state, "guest process exited");
        self.state
    }

    /// Checks whether the process has exited without blocking.
    pub fn poll(&mut self) -> io::Result<ProcessState> {
        if self.state == ProcessState::Running {
            if let Some(exit) = self.process.try_wait()? {
                self.record(exit);
            }
        }

        Ok(self.state)
    }

    /// Blocks until the process exits.
    pub fn wait(&mut self) -> io::Result<ProcessState> {
        if self.state == ProcessState::Running {
            let exit = self.process.wait()?;
            self.record(exit);
        }

        Ok(self.state)
    }

    /// Blocks until the process exits or `ack` fires, whichever comes first.
    pub fn wait_or_acknowledged(
        &mut self,
        ack: &Acknowledgment<'_>,
    ) -> io::Result<WaitOutcome> {
        loop {
            let state = self.poll()?;
            if state != ProcessState::Running {
                return Ok(WaitOutcome::Exited(state));
            }

            match ack.wait_timeout(self.poll_interval) {
                AckStatus::Pending => {}
                AckStatus::Acknowledged => return Ok(WaitOutcome::Acknowledged),
                AckStatus::Cancelled => return Ok(WaitOutcome::Cancelled),
            }
        }
    }

    /// Requests a guest shutdown, then waits up to `grace` for the process to
    /// exit before killing it.
    pub fn shut_down(&mut self, grace: Duration) -> io::Result<ProcessState> {
        if self.poll()? != ProcessState::Running {
            return Ok(self.state);
        }

        if let Err(e) = self.process.request_shutdown() {
            warn!(
                error = %e,
                "failed to request guest shutdown; waiting anyway"
            );
        }

        let deadline = Instant::now() + grace;
        loop {
            if self.poll()? != ProcessState::Running {
                return Ok(self.state);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            std::thread::sleep(self.poll_interval.min(deadline - now));
        }

        warn!(
            ?grace,
            "guest did not power off within the grace period; killing it"
        );
        self.process.kill()?;
        let exit = self.process.wait()?;

        // If the process managed to exit on its own between the last poll and
        // the kill, report how it really exited.
        self.state = match exit.code() {
            Some(_) => ProcessState::from_exit(exit),
            None => ProcessState::Killed,
        };

        Ok(self.state)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.state == ProcessState::Running {
            let _ = self.process.kill();
            let _ = self.process.wait();
        }
    }
}
