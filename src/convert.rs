// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converts the finished working disk into deployable image formats.

use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::DiskFormat,
    disk_tool::{ConvertRequest, DiskImageTool},
    ui::Ui,
    util::ToolError,
};

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("source image {0} does not exist")]
    SourceMissing(Utf8PathBuf),

    #[error("the disk image tool cannot write {0} images")]
    UnsupportedFormat(DiskFormat),

    #[error("{0} already exists and was not overwritten")]
    OverwriteDeclined(Utf8PathBuf),

    #[error("preparing output path {path}")]
    Output {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("converting to {format}")]
    Tool {
        format: DiskFormat,
        #[source]
        source: ToolError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionResult {
    pub format: DiskFormat,
    pub path: Utf8PathBuf,
    pub size: u64,
    pub duration: Duration,
}

/// Options that make the output usable where each format is typically
/// deployed.
pub fn target_options(
    source: DiskFormat,
    target: DiskFormat,
) -> Option<&'static str> {
    match (source, target) {
        // Azure only accepts fixed VHDs whose size is a whole number of MiB;
        // force_size stops qemu-img from rounding to a CHS geometry.
        (_, DiskFormat::Vhd) => Some("subformat=fixed,force_size=on"),

        // The layout vSphere and EC2 import tools expect.
        (_, DiskFormat::Vmdk) => Some("subformat=streamOptimized"),

        (DiskFormat::Qcow2, DiskFormat::Qcow2) => Some("cluster_size=2M"),
        _ => None,
    }
}

/// Converts `source` (in `source_format`) to `target` at `output`.
///
/// If `output` exists the operator has to agree to overwrite it; declining
/// fails just this conversion.
pub fn convert(
    source: &Utf8Path,
    source_format: DiskFormat,
    target: DiskFormat,
    output: &Utf8Path,
    tool: &dyn DiskImageTool,
    ui: &dyn Ui,
) -> Result<ConversionResult, ConversionError> {
    if !source.exists() {
        return Err(ConversionError::SourceMissing(source.to_owned()));
    }

    match tool.supported_formats(ui) {
        Ok(formats) => {
            if !formats.iter().any(|f| f == target.qemu_name()) {
                return Err(ConversionError::UnsupportedFormat(target));
            }
        }
        Err(e) => {
            warn!(error = %e, "couldn't list supported formats; trying anyway")
        }
    }

    match tool.info(source, ui) {
        Ok(image) => {
            debug!(
                %source,
                format = %image.format,
                virtual_size = image.virtual_size,
                actual_size = ?image.actual_size,
                "inspected source image"
            );

            let reported = DiskFormat::from_qemu_name(&image.format);
            if reported != Some(source_format) {
                warn!(
                    %source,
                    configured = %source_format,
                    reported = %image.format,
                    "source image format differs from the configuration"
                );
                ui.set_substep(&format!(
                    "warning: {source} looks like {} but is configured as \
                     {source_format}",
                    image.format
                ));
            }
        }
        Err(e) => warn!(%source, error = %e, "couldn't inspect source image"),
    }

    if output.exists() {
        let overwrite = ui.confirm(
            &format!("{output} already exists. Overwrite it?"),
            false,
        );
        if !overwrite {
            return Err(ConversionError::OverwriteDeclined(output.to_owned()));
        }

        std::fs::remove_file(output).map_err(|source| ConversionError::Output {
            path: output.to_owned(),
            source,
        })?;
    }

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|source| {
            ConversionError::Output { path: parent.to_owned(), source }
        })?;
    }

    let started = Instant::now();
    tool.convert(
        &ConvertRequest {
            source,
            source_format,
            target_format: target,
            options: target_options(source_format, target),
            destination: output,
        },
        ui,
    )
    .map_err(|source| ConversionError::Tool { format: target, source })?;
    let duration = started.elapsed();

    let size = std::fs::metadata(output)
        .map_err(|source| ConversionError::Output {
            path: output.to_owned(),
            source,
        })?
        .len();

    info!(%output, %target, size, ?duration, "converted image");
    Ok(ConversionResult {
        format: target,
        path: output.to_owned(),
        size,
        duration,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        disk_tool::testing::{DiskToolCall, FakeDiskTool},
        ui::testing::ScriptedUi,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        source: Utf8PathBuf,
        output: Utf8PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let source = root.join("win.qcow2");
        std::fs::write(&source, b"disk").unwrap();
        Fixture { _dir: dir, source, output: root.join("output/win.vhd") }
    }

    #[test]
    fn converts_with_format_options() {
        let f = fixture();
        let tool = FakeDiskTool::default();
        let ui = ScriptedUi::default();

        let result = convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ui,
        )
        .unwrap();

        assert_eq!(result.format, DiskFormat::Vhd);
        assert_eq!(result.path, f.output);
        assert_eq!(result.size, tool.output_bytes as u64);
        assert_eq!(
            tool.converts(),
            [DiskToolCall::Convert {
                from: DiskFormat::Qcow2,
                to: DiskFormat::Vhd,
                options: Some("subformat=fixed,force_size=on"),
                source: f.source.clone(),
                destination: f.output.clone(),
            }]
        );
    }

    #[test]
    fn layout_options_per_target() {
        use DiskFormat::*;
        assert_eq!(target_options(Qcow2, Raw), None);
        assert_eq!(
            target_options(Raw, Vmdk),
            Some("subformat=streamOptimized")
        );
        assert_eq!(target_options(Qcow2, Qcow2), Some("cluster_size=2M"));
        assert_eq!(target_options(Raw, Qcow2), None);
        assert_eq!(
            target_options(Vmdk, Vhd),
            Some("subformat=fixed,force_size=on")
        );
    }

    #[test]
    fn format_mismatch_is_only_a_warning() {
        let f = fixture();
        let tool = FakeDiskTool {
            reported_format: Some("raw".to_string()),
            ..Default::default()
        };
        convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ScriptedUi::default(),
        )
        .unwrap();
    }

    #[test]
    fn failed_inspection_is_only_a_warning() {
        let f = fixture();
        let tool = FakeDiskTool { reported_format: None, ..Default::default() };
        convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ScriptedUi::default(),
        )
        .unwrap();
    }

    #[test]
    fn existing_output_needs_confirmation() {
        let f = fixture();
        std::fs::create_dir_all(f.output.parent().unwrap()).unwrap();
        std::fs::write(&f.output, b"previous build").unwrap();
        let tool = FakeDiskTool::default();

        let err = convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ScriptedUi::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::OverwriteDeclined(_)));
        assert!(tool.converts().is_empty());
        assert_eq!(std::fs::read(&f.output).unwrap(), b"previous build");

        let ui = ScriptedUi::default().answering(&[true]);
        convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ui,
        )
        .unwrap();
        assert_eq!(tool.converts().len(), 1);
    }

    #[test]
    fn missing_source_fails() {
        let f = fixture();
        std::fs::remove_file(&f.source).unwrap();
        let err = convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Raw,
            &f.output,
            &FakeDiskTool::default(),
            &ScriptedUi::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::SourceMissing(_)));
    }

    #[test]
    fn unsupported_target_fails_without_converting() {
        let f = fixture();
        let tool = FakeDiskTool {
            unsupported: [DiskFormat::Vmdk].into_iter().collect(),
            ..Default::default()
        };
        let err = convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vmdk,
            &f.output,
            &tool,
            &ScriptedUi::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConversionError::UnsupportedFormat(DiskFormat::Vmdk)
        ));
        assert!(tool.converts().is_empty());
    }

    #[test]
    fn tool_failure_names_the_format() {
        let f = fixture();
        let tool = FakeDiskTool {
            fail_convert_to: [DiskFormat::Vhd].into_iter().collect(),
            ..Default::default()
        };
        let err = convert(
            &f.source,
            DiskFormat::Qcow2,
            DiskFormat::Vhd,
            &f.output,
            &tool,
            &ScriptedUi::default(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "converting to vhd");
    }
}
