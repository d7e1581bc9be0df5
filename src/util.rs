// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions for running the external tools a build depends on.

use std::process::{Command, Output};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::{process::ProcessExit, ui::Ui};

/// A failure running an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch '{program}'")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' returned non-success {exit}: {stderr}")]
    Failed { program: String, exit: ProcessExit, stderr: String },

    #[error("unexpected output from '{program}': {reason}")]
    Output { program: String, reason: String },
}

/// Runs a `Command` and returns its output. Returns `Err` if the command's exit
/// status indicates that it failed.
pub fn run_command_check_status(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> Result<Output, ToolError> {
    ui.set_substep(&format!("executing: {:?}", cmd));
    debug!(command = ?cmd, "running external tool");

    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd.output().map_err(|source| ToolError::Launch {
        program: program.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            program,
            exit: output.status.into(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(output)
}

/// Runs the supplied `cmd` and searches its `stdout` for the first line
/// containing `row_contains`, then returns the whitespace-separated words that
/// follow `row_contains` on that line.
///
/// Note that all searches are case-sensitive.
pub fn grep_command_for_row(
    cmd: &mut Command,
    row_contains: &str,
    ui: &dyn Ui,
) -> Result<Vec<String>, ToolError> {
    let output = run_command_check_status(cmd, ui)?.stdout;
    let output = String::from_utf8_lossy(&output);
    for line in output.lines() {
        let Some((_, rest)) = line.split_once(row_contains) else {
            continue;
        };

        return Ok(rest.split_whitespace().map(str::to_owned).collect());
    }

    Err(ToolError::Output {
        program: cmd.get_program().to_string_lossy().into_owned(),
        reason: format!("'{row_contains}' not found in output"),
    })
}

/// Resolves `program` to a file on disk. Bare names are looked up in `PATH`;
/// anything containing a path separator is taken as a path.
pub fn find_executable(program: &Utf8Path) -> Option<Utf8PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_owned());
    }

    which::which(program.as_str())
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ui::testing::ScriptedUi;

    #[test]
    fn failed_commands_report_exit_and_stderr() {
        let ui = ScriptedUi::default();
        let err = run_command_check_status(
            Command::new("sh").args(["-c", "echo oops >&2; exit 7"]),
            &ui,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ToolError::Failed { exit, .. } if exit == ProcessExit::from_code(7)
        ));
        assert!(err.to_string().contains("oops"), "{err}");
    }

    #[test]
    fn grep_returns_words_after_label() {
        let ui = ScriptedUi::default();
        let words = grep_command_for_row(
            Command::new("sh").args([
                "-c",
                "echo usage; echo 'Supported formats: raw qcow2 vpc'",
            ]),
            "Supported formats:",
            &ui,
        )
        .unwrap();

        assert_eq!(words, ["raw", "qcow2", "vpc"]);
    }

    #[test]
    fn grep_fails_when_label_is_absent() {
        let ui = ScriptedUi::default();
        let err = grep_command_for_row(
            Command::new("sh").args(["-c", "echo nothing here"]),
            "Supported formats:",
            &ui,
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::Output { .. }));
    }

    #[test]
    fn find_executable_handles_paths_and_names() {
        assert!(find_executable(Utf8Path::new("sh")).is_some());
        assert!(
            find_executable(Utf8Path::new("/definitely/not/here")).is_none()
        );
        assert!(
            find_executable(Utf8Path::new("wimbake-no-such-tool-anywhere"))
                .is_none()
        );
    }
}
