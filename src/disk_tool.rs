// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operations on virtual disk files, delegated to `qemu-img`.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::{
    config::{DiskFormat, DiskSize},
    ui::Ui,
    util::{grep_command_for_row, run_command_check_status, ToolError},
};

/// What `qemu-img info` says about an image.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ImageInfo {
    /// The format driver name, e.g. "qcow2" or "vpc".
    pub format: String,

    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,

    /// Bytes actually allocated on the host. Not all formats report this.
    #[serde(rename = "actual-size", default)]
    pub actual_size: Option<u64>,
}

pub struct ConvertRequest<'a> {
    pub source: &'a Utf8Path,
    pub source_format: DiskFormat,
    pub target_format: DiskFormat,

    /// Format-specific creation options, passed to `qemu-img convert -o`.
    pub options: Option<&'static str>,
    pub destination: &'a Utf8Path,
}

/// The disk image operations a build needs.
pub trait DiskImageTool {
    fn create(
        &self,
        format: DiskFormat,
        size: DiskSize,
        path: &Utf8Path,
        ui: &dyn Ui,
    ) -> Result<(), ToolError>;

    fn convert(
        &self,
        request: &ConvertRequest<'_>,
        ui: &dyn Ui,
    ) -> Result<(), ToolError>;

    fn info(
        &self,
        path: &Utf8Path,
        ui: &dyn Ui,
    ) -> Result<ImageInfo, ToolError>;

    /// The format driver names this tool can read and write.
    fn supported_formats(&self, ui: &dyn Ui) -> Result<Vec<String>, ToolError>;
}

pub struct QemuImg {
    program: Utf8PathBuf,
}

impl QemuImg {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self { program: program.into() }
    }

    fn command(&self) -> Command {
        Command::new(self.program.as_std_path())
    }
}

impl DiskImageTool for QemuImg {
    fn create(
        &self,
        format: DiskFormat,
        size: DiskSize,
        path: &Utf8Path,
        ui: &dyn Ui,
    ) -> Result<(), ToolError> {
        run_command_check_status(
            self.command().args([
                "create",
                "-f",
                format.qemu_name(),
                path.as_str(),
                &size.to_string(),
            ]),
            ui,
        )
        .map(|_| ())
    }

    fn convert(
        &self,
        request: &ConvertRequest<'_>,
        ui: &dyn Ui,
    ) -> Result<(), ToolError> {
        let mut cmd = self.command();
        cmd.args([
            "convert",
            "-f",
            request.source_format.qemu_name(),
            "-O",
            request.target_format.qemu_name(),
        ]);

        if let Some(options) = request.options {
            cmd.args(["-o", options]);
        }

        cmd.args([request.source.as_str(), request.destination.as_str()]);
        run_command_check_status(&mut cmd, ui).map(|_| ())
    }

    fn info(
        &self,
        path: &Utf8Path,
        ui: &dyn Ui,
    ) -> Result<ImageInfo, ToolError> {
        let output = run_command_check_status(
            self.command().args(["info", "--output=json", path.as_str()]),
            ui,
        )?;

        parse_info(&output.stdout).map_err(|e| ToolError::Output {
            program: self.program.to_string(),
            reason: e.to_string(),
        })
    }

    fn supported_formats(&self, ui: &dyn Ui) -> Result<Vec<String>, ToolError> {
        grep_command_for_row(
            self.command().arg("--help"),
            "Supported formats:",
            ui,
        )
    }
}

fn parse_info(stdout: &[u8]) -> serde_json::Result<ImageInfo> {
    serde_json::from_slice(stdout)
}
