// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checks that everything a build needs is in place before it starts.

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use thiserror::Error;

use crate::{
    compress::{Availability, CompressionScheme, Compressor},
    config::{BuildConfiguration, BuildPaths, DiskFormat},
    orchestrator::{Phase, SkipFlags},
    util::find_executable,
};

const MIB: u64 = 1 << 20;

/// Anything smaller can't be a Windows installation ISO.
const MIN_INSTALL_MEDIA_BYTES: u64 = 100 * MIB;
const MIN_DRIVER_MEDIA_BYTES: u64 = MIB;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrerequisiteError {
    #[error("{name} not found at {path}")]
    MissingArtifact { name: &'static str, path: Utf8PathBuf },

    #[error("{name} appears to be corrupt: {reason}")]
    CorruptArtifact { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
#[error("{} build prerequisites were not satisfied", .errors.len())]
pub struct MissingPrerequisites {
    pub errors: Vec<PrerequisiteError>,
}

fn check_file(
    name: &'static str,
    path: &Utf8Path,
    min_bytes: u64,
) -> Result<(), PrerequisiteError> {
    let len = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(PrerequisiteError::MissingArtifact {
                name,
                path: path.to_owned(),
            })
        }
    };

    if len < min_bytes {
        return Err(PrerequisiteError::CorruptArtifact {
            name,
            reason: format!(
                "{path} is {len} bytes, expected at least {min_bytes}"
            ),
        });
    }

    Ok(())
}

fn check_program(
    name: &'static str,
    program: &Utf8Path,
) -> Result<(), PrerequisiteError> {
    let Some(path) = find_executable(program) else {
        return Err(PrerequisiteError::MissingArtifact {
            name,
            path: program.to_owned(),
        });
    };

    check_file(name, &path, 1)
}

/// Checks every prerequisite of a build with the given skip flags and output
/// formats. Returns non-fatal warnings on success, or every unsatisfied
/// prerequisite on failure.
pub fn validate(
    config: &BuildConfiguration,
    paths: &BuildPaths,
    skip: SkipFlags,
    output_formats: &[DiskFormat],
    compressor: &Compressor,
) -> Result<Vec<String>, MissingPrerequisites> {
    let mut checks = Vec::new();

    if !skip.skips(Phase::Installing) {
        checks.push(check_file(
            "installation media",
            paths.install_media(),
            MIN_INSTALL_MEDIA_BYTES,
        ));
    }

    if !skip.skips(Phase::Installing) || !skip.skips(Phase::Configuring) {
        checks.push(check_file(
            "driver media",
            paths.driver_media(),
            MIN_DRIVER_MEDIA_BYTES,
        ));
    }

    if skip.runs_any_guest_phase() {
        checks.push(check_program("emulator", paths.emulator()));
    }

    checks.push(check_program("disk image tool", paths.disk_tool()));

    let errors: Vec<_> = checks.into_iter().filter_map(Result::err).collect();
    if !errors.is_empty() {
        return Err(MissingPrerequisites { errors });
    }

    Ok(compression_warnings(config, output_formats, compressor))
}

fn compression_warnings(
    config: &BuildConfiguration,
    output_formats: &[DiskFormat],
    compressor: &Compressor,
) -> Vec<String> {
    if !config.compression.enabled {
        return Vec::new();
    }

    output_formats
        .iter()
        .map(|f| config.compression.scheme_for(*f))
        .unique()
        .filter_map(|name| match name.parse::<CompressionScheme>() {
            Err(e) => {
                Some(format!("{e}; outputs using it won't be compressed"))
            }
            Ok(scheme) => match compressor.availability(scheme) {
                Availability::Preferred(_) => None,
                Availability::Fallback { preferred, using } => Some(format!(
                    "{preferred} not found; {scheme} compression will use \
                     {using}"
                )),
                Availability::Unavailable => Some(format!(
                    "no {scheme} compression tool is installed; outputs \
                     using it won't be compressed"
                )),
            },
        })
        .collect()
}
