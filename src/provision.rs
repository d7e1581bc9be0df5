// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creates the working disk, or reuses the one a previous run left behind.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::info;

use crate::{
    config::{BuildConfiguration, BuildPaths},
    disk_tool::DiskImageTool,
    ui::Ui,
    util::ToolError,
};

#[derive(Debug, Error)]
pub enum DiskCreateError {
    #[error("creating directory {path}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("removing existing working disk {path}")]
    Remove {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("creating working disk {path}")]
    Create {
        path: Utf8PathBuf,
        #[source]
        source: ToolError,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedDisk {
    pub path: Utf8PathBuf,

    /// True if an existing disk was kept instead of creating a new one.
    pub reused: bool,
}

/// Ensures a working disk exists at the build's working disk path.
///
/// If a disk is already there, the operator decides whether to destroy and
/// recreate it. Declining (the default) keeps the existing disk untouched,
/// whatever state the previous run left it in.
///
/// Creation is never retried: a failed `qemu-img create` may have left a
/// partially written file behind.
pub fn provision(
    paths: &BuildPaths,
    config: &BuildConfiguration,
    tool: &dyn DiskImageTool,
    ui: &dyn Ui,
) -> Result<ProvisionedDisk, DiskCreateError> {
    let path = paths.working_disk();
    if path.exists() {
        let recreate = ui.confirm(
            &format!(
                "A working disk already exists at {path}. Destroy it and \
                 create a new one?"
            ),
            false,
        );

        if !recreate {
            info!(%path, "reusing existing working disk");
            return Ok(ProvisionedDisk { path, reused: true });
        }

        ui.set_substep(&format!("removing {path}"));
        std::fs::remove_file(&path).map_err(|source| {
            DiskCreateError::Remove { path: path.clone(), source }
        })?;
    }

    create_parent_dir(&path)?;
    tool.create(config.disk_format, config.disk_size_spec, &path, ui)
        .map_err(|source| DiskCreateError::Create {
            path: path.clone(),
            source,
        })?;

    info!(
        %path,
        format = %config.disk_format,
        size = %config.disk_size_spec,
        bytes = config.disk_size_spec.bytes(),
        "created working disk"
    );
    Ok(ProvisionedDisk { path, reused: false })
}

fn create_parent_dir(path: &Utf8Path) -> Result<(), DiskCreateError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };

    std::fs::create_dir_all(parent).map_err(|source| {
        DiskCreateError::CreateDir { path: parent.to_owned(), source }
    })
}
