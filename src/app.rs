// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use crate::{config::DiskFormat, orchestrator::SkipFlags};

#[derive(Parser)]
#[command(version, about)]
pub struct App {
    /// Forces the tool to run in an interactive or non-interactive mode. If not
    /// set, the tool infers whether to run interactively from whether it is
    /// running in an interactive terminal.
    #[arg(long, global = true, default_value = Option::None)]
    pub interactive: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Installs, configures, and generalizes Windows on a working disk, then
    /// converts the disk into each requested output format.
    Build {
        #[command(flatten)]
        args: BuildArgs,
    },

    /// Writes an example build configuration to get started from.
    WriteConfig {
        /// The path at which to write the configuration.
        #[arg(long)]
        path: Utf8PathBuf,

        /// Overwrites the file at `path` if it already exists.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Validates a build configuration and prints it with every default
    /// filled in.
    CheckConfig {
        /// The path to the configuration to check.
        #[arg(long)]
        config: Utf8PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
pub struct BuildArgs {
    /// The path to the build configuration (see write-config).
    #[arg(long)]
    pub config: Utf8PathBuf,

    /// The directory that holds the working disk, outputs, and logs. Relative
    /// media paths in the configuration are resolved against it.
    #[arg(long)]
    pub work_dir: Utf8PathBuf,

    /// The name of the VM, used to name the working disk, the output images,
    /// and the emulator console logs.
    #[arg(long, value_parser = parse_vm_name)]
    pub name: String,

    #[command(flatten)]
    pub skip: SkipArgs,

    /// An output format to convert the finished disk to. May be repeated; if
    /// given, replaces the configuration's `outputFormats`.
    #[arg(long = "output-format", value_enum)]
    pub output_formats: Vec<DiskFormat>,
}

/// Guest phases to skip. Use these to resume from a working disk a previous
/// build left behind.
#[derive(Args, Clone, Debug, Default)]
pub struct SkipArgs {
    /// Skips installing Windows.
    #[arg(long, default_value_t = false)]
    pub skip_install: bool,

    /// Skips the interactive configuration phase.
    #[arg(long, default_value_t = false)]
    pub skip_configure: bool,

    /// Skips generalizing the installation.
    #[arg(long, default_value_t = false)]
    pub skip_generalize: bool,

    /// Skips booting the generalized image for a test run.
    #[arg(long, default_value_t = false)]
    pub skip_test_boot: bool,
}

impl From<&SkipArgs> for SkipFlags {
    fn from(args: &SkipArgs) -> Self {
        Self {
            install: args.skip_install,
            configure: args.skip_configure,
            generalize: args.skip_generalize,
            test_boot: args.skip_test_boot,
        }
    }
}

/// VM names become file names, so they're limited to characters that are
/// safe in paths and in QEMU option strings.
fn parse_vm_name(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("the VM name can't be empty".to_string());
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!(
            "'{c}' isn't allowed in a VM name (use letters, digits, '-', '_')"
        ));
    }

    Ok(name.to_string())
}
