// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The build configuration document and the paths derived from it.
//!
//! A configuration is a JSON document with camelCase keys. Four fields are
//! required (`memoryMebibytes`, `cpuCount`, `diskSizeSpec`, `diskFormat`);
//! everything else has a default. Unknown keys are ignored so that older
//! builds of this tool can read documents written for newer ones.

use std::{collections::BTreeMap, fmt, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    NotFound(Utf8PathBuf),

    #[error("reading configuration file {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing configuration file {path}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("configuration field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("serializing configuration")]
    Serialize(#[source] serde_json::Error),

    #[error("writing configuration file {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A virtual disk encoding understood by `qemu-img`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vhd,
    Vmdk,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 4] =
        [DiskFormat::Qcow2, DiskFormat::Raw, DiskFormat::Vhd, DiskFormat::Vmdk];

    /// The name of this format as written in configuration documents and
    /// shown to the user.
    pub fn name(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vhd => "vhd",
            DiskFormat::Vmdk => "vmdk",
        }
    }

    /// The driver name `qemu-img` and QEMU use for this format. VHD is
    /// called "vpc" for historical reasons.
    pub fn qemu_name(self) -> &'static str {
        match self {
            DiskFormat::Vhd => "vpc",
            other => other.name(),
        }
    }

    pub fn from_qemu_name(name: &str) -> Option<Self> {
        DiskFormat::ALL.into_iter().find(|f| f.qemu_name() == name)
    }

    pub fn extension(self) -> &'static str {
        self.name()
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        DiskFormat::ALL.into_iter().find(|f| f.name() == lower).ok_or_else(
            || {
                format!(
                    "unknown disk format '{s}' (expected one of: {})",
                    DiskFormat::ALL.iter().join(", ")
                )
            },
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SizeUnit {
    K,
    M,
    G,
    T,
}

impl SizeUnit {
    fn shift(self) -> u32 {
        match self {
            SizeUnit::K => 10,
            SizeUnit::M => 20,
            SizeUnit::G => 30,
            SizeUnit::T => 40,
        }
    }

    fn suffix(self) -> char {
        match self {
            SizeUnit::K => 'K',
            SizeUnit::M => 'M',
            SizeUnit::G => 'G',
            SizeUnit::T => 'T',
        }
    }
}

/// A disk size of the form `<digits><unit>`, e.g. "150G", in the notation
/// `qemu-img create` accepts. Units are binary (K = 1024 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskSize {
    value: u64,
    unit: SizeUnit,
}

impl DiskSize {
    pub fn bytes(&self) -> u64 {
        // Parsing rejects sizes that overflow.
        self.value << self.unit.shift()
    }
}

impl FromStr for DiskSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(last) = s.chars().last() else {
            return Err("size is empty".to_string());
        };

        let unit = match last.to_ascii_uppercase() {
            'K' => SizeUnit::K,
            'M' => SizeUnit::M,
            'G' => SizeUnit::G,
            'T' => SizeUnit::T,
            _ => {
                return Err(format!(
                    "'{s}' does not end in a size unit (K, M, G, or T)"
                ))
            }
        };

        let digits = &s[..s.len() - last.len_utf8()];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!(
                "'{s}' is not a whole number followed by a unit"
            ));
        }

        let value: u64 =
            digits.parse().map_err(|e| format!("'{s}' is out of range: {e}"))?;
        if value == 0 {
            return Err("size must be greater than zero".to_string());
        }

        if value.leading_zeros() < unit.shift() {
            return Err(format!("'{s}' is too large"));
        }

        Ok(Self { value, unit })
    }
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

impl Serialize for DiskSize {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DiskSize {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelerationMode {
    /// Pure emulation (TCG). Works anywhere; very slow.
    Software,

    /// KVM.
    #[default]
    Hardware,
}

impl FromStr for AccelerationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Ok(Self::Software),
            "hardware" => Ok(Self::Hardware),
            _ => Err(format!(
                "unknown acceleration mode '{s}' (expected 'software' or \
                 'hardware')"
            )),
        }
    }
}

/// The bus the working disk is attached to inside the guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskInterface {
    #[default]
    Ide,
    Virtio,
}

impl DiskInterface {
    pub fn qemu_name(self) -> &'static str {
        match self {
            DiskInterface::Ide => "ide",
            DiskInterface::Virtio => "virtio",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProtocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for ForwardProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardProtocol::Tcp => f.write_str("tcp"),
            ForwardProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// A host port forwarded into the guest over QEMU user networking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    #[serde(default)]
    pub protocol: ForwardProtocol,
    pub host_port: u16,
    pub guest_port: u16,
}

/// Compression settings. Scheme names are interpreted by the compressor, not
/// here, so an unrecognized name only fails the outputs that use it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionSettings {
    pub enabled: bool,
    pub scheme: String,

    /// Per-output-format scheme overrides, keyed by format name.
    pub per_format: BTreeMap<String, String>,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            scheme: "gzip".to_string(),
            per_format: BTreeMap::new(),
        }
    }
}

impl CompressionSettings {
    pub fn scheme_for(&self, format: DiskFormat) -> &str {
        self.per_format
            .get(format.name())
            .map(String::as_str)
            .unwrap_or(&self.scheme)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaPaths {
    /// The Windows installation ISO.
    pub install_media: Utf8PathBuf,

    /// An ISO with signed virtio drivers, attached while installing and
    /// configuring.
    pub driver_media: Utf8PathBuf,
}

impl Default for MediaPaths {
    fn default() -> Self {
        Self {
            install_media: "media/windows.iso".into(),
            driver_media: "media/virtio-win.iso".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmulatorSettings {
    pub binary: Utf8PathBuf,
    pub disk_tool: Utf8PathBuf,
    pub disk_interface: DiskInterface,

    /// Passed verbatim to QEMU's `-display` option.
    pub display: String,

    /// The localhost port on which QEMU serves its monitor. The build uses
    /// the monitor to ask the guest to power off after interactive phases.
    pub monitor_port: u16,

    pub shutdown_grace_seconds: u64,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".into(),
            disk_tool: "qemu-img".into(),
            disk_interface: DiskInterface::default(),
            display: "vnc=127.0.0.1:0".to_string(),
            monitor_port: 8888,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkSettings {
    pub forwards: Vec<PortForward>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        // Remote Desktop.
        Self {
            forwards: vec![PortForward {
                protocol: ForwardProtocol::Tcp,
                host_port: 33389,
                guest_port: 3389,
            }],
        }
    }
}

/// A validated build configuration. Immutable for the duration of a build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfiguration {
    pub memory_mebibytes: u32,
    pub cpu_count: u32,
    pub disk_size_spec: DiskSize,
    pub disk_format: DiskFormat,
    pub acceleration_mode: AccelerationMode,
    pub output_formats: Vec<DiskFormat>,
    pub compression: CompressionSettings,
    pub media: MediaPaths,
    pub emulator: EmulatorSettings,
    pub network: NetworkSettings,
}

/// The document as written, before required fields are checked.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfiguration {
    memory_mebibytes: Option<i64>,
    cpu_count: Option<i64>,
    disk_size_spec: Option<String>,
    disk_format: Option<String>,
    acceleration_mode: Option<String>,
    #[serde(default)]
    output_formats: Vec<String>,
    #[serde(default)]
    compression: CompressionSettings,
    #[serde(default)]
    media: MediaPaths,
    #[serde(default)]
    emulator: EmulatorSettings,
    #[serde(default)]
    network: NetworkSettings,
}

fn positive_u32(
    field: &'static str,
    value: Option<i64>,
) -> Result<u32, ConfigError> {
    let value = value.ok_or(ConfigError::MissingField(field))?;
    match u32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::InvalidField {
            field,
            reason: format!("{value} is not a positive 32-bit integer"),
        }),
    }
}

impl RawConfiguration {
    fn validate(self) -> Result<BuildConfiguration, ConfigError> {
        let memory_mebibytes =
            positive_u32("memoryMebibytes", self.memory_mebibytes)?;
        let cpu_count = positive_u32("cpuCount", self.cpu_count)?;

        let disk_size_spec = self
            .disk_size_spec
            .ok_or(ConfigError::MissingField("diskSizeSpec"))?
            .parse::<DiskSize>()
            .map_err(|reason| ConfigError::InvalidField {
                field: "diskSizeSpec",
                reason,
            })?;

        let disk_format = self
            .disk_format
            .ok_or(ConfigError::MissingField("diskFormat"))?
            .parse::<DiskFormat>()
            .map_err(|reason| ConfigError::InvalidField {
                field: "diskFormat",
                reason,
            })?;

        let acceleration_mode = match self.acceleration_mode {
            Some(mode) => mode.parse().map_err(|reason| {
                ConfigError::InvalidField { field: "accelerationMode", reason }
            })?,
            None => AccelerationMode::default(),
        };

        let output_formats = self
            .output_formats
            .iter()
            .map(|f| f.parse::<DiskFormat>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| ConfigError::InvalidField {
                field: "outputFormats",
                reason,
            })?
            .into_iter()
            .unique()
            .collect();

        let mut compression = self.compression;
        compression.per_format = compression
            .per_format
            .into_iter()
            .map(|(format, scheme)| {
                let format = format.parse::<DiskFormat>().map_err(|reason| {
                    ConfigError::InvalidField {
                        field: "compression.perFormat",
                        reason,
                    }
                })?;
                Ok((format.name().to_string(), scheme))
            })
            .collect::<Result<_, ConfigError>>()?;

        if let Some(bad) = self
            .network
            .forwards
            .iter()
            .find(|fwd| fwd.host_port == 0 || fwd.guest_port == 0)
        {
            return Err(ConfigError::InvalidField {
                field: "network.forwards",
                reason: format!(
                    "port 0 is not forwardable ({}::{}-:{})",
                    bad.protocol, bad.host_port, bad.guest_port
                ),
            });
        }

        Ok(BuildConfiguration {
            memory_mebibytes,
            cpu_count,
            disk_size_spec,
            disk_format,
            acceleration_mode,
            output_formats,
            compression,
            media: self.media,
            emulator: self.emulator,
            network: self.network,
        })
    }
}

impl BuildConfiguration {
    /// A reasonable starting point for a new build.
    pub fn example() -> Self {
        Self {
            memory_mebibytes: 4096,
            cpu_count: 2,
            disk_size_spec: DiskSize { value: 150, unit: SizeUnit::G },
            disk_format: DiskFormat::Qcow2,
            acceleration_mode: AccelerationMode::Hardware,
            output_formats: vec![DiskFormat::Vhd, DiskFormat::Vmdk],
            compression: CompressionSettings::default(),
            media: MediaPaths::default(),
            emulator: EmulatorSettings::default(),
            network: NetworkSettings::default(),
        }
    }

    pub fn from_json(json: &str, path: &Utf8Path) -> Result<Self, ConfigError> {
        let raw: RawConfiguration = serde_json::from_str(json).map_err(
            |source| ConfigError::Parse { path: path.to_owned(), source },
        )?;
        raw.validate()
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Reads and validates the configuration document at `path`.
pub fn load(path: &Utf8Path) -> Result<BuildConfiguration, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_owned()))
        }
        Err(source) => {
            return Err(ConfigError::Read { path: path.to_owned(), source })
        }
    };

    BuildConfiguration::from_json(&contents, path)
}

pub fn save(
    config: &BuildConfiguration,
    path: &Utf8Path,
) -> Result<(), ConfigError> {
    let mut json = config.to_json()?;
    json.push('\n');
    std::fs::write(path, json)
        .map_err(|source| ConfigError::Write { path: path.to_owned(), source })
}

/// Every file a build touches, rooted at an explicit working directory.
#[derive(Clone, Debug)]
pub struct BuildPaths {
    work_dir: Utf8PathBuf,
    vm_name: String,
    disk_format: DiskFormat,
    install_media: Utf8PathBuf,
    driver_media: Utf8PathBuf,
    emulator: Utf8PathBuf,
    disk_tool: Utf8PathBuf,
}

fn resolve(work_dir: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        work_dir.join(path)
    }
}

/// Bare program names are left for a `PATH` lookup; anything with a
/// separator is a path and is rooted like the media paths.
fn resolve_program(work_dir: &Utf8Path, program: &Utf8Path) -> Utf8PathBuf {
    if program.components().count() > 1 {
        resolve(work_dir, program)
    } else {
        program.to_owned()
    }
}

impl BuildPaths {
    pub fn new(
        work_dir: &Utf8Path,
        vm_name: &str,
        config: &BuildConfiguration,
    ) -> Self {
        Self {
            work_dir: work_dir.to_owned(),
            vm_name: vm_name.to_owned(),
            disk_format: config.disk_format,
            install_media: resolve(work_dir, &config.media.install_media),
            driver_media: resolve(work_dir, &config.media.driver_media),
            emulator: resolve_program(work_dir, &config.emulator.binary),
            disk_tool: resolve_program(work_dir, &config.emulator.disk_tool),
        }
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn working_disk(&self) -> Utf8PathBuf {
        self.work_dir.join(format!(
            "{}.{}",
            self.vm_name,
            self.disk_format.extension()
        ))
    }

    pub fn output_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("output")
    }

    pub fn output_image(&self, format: DiskFormat) -> Utf8PathBuf {
        self.output_dir()
            .join(format!("{}.{}", self.vm_name, format.extension()))
    }

    pub fn logs_dir(&self) -> Utf8PathBuf {
        self.work_dir.join("logs")
    }

    /// The file that receives the emulator's console output for a phase.
    pub fn transcript(&self, phase_slug: &str) -> Utf8PathBuf {
        self.logs_dir().join(format!("{}-{phase_slug}.log", self.vm_name))
    }

    pub fn install_media(&self) -> &Utf8Path {
        &self.install_media
    }

    pub fn driver_media(&self) -> &Utf8Path {
        &self.driver_media
    }

    pub fn emulator(&self) -> &Utf8Path {
        &self.emulator
    }

    pub fn disk_tool(&self) -> &Utf8Path {
        &self.disk_tool
    }
}
