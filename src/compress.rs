// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wraps converted images in compressed archives.
//!
//! Each scheme has an ordered list of mechanisms. The first one available on
//! this machine is used; a later mechanism is only tried when an earlier
//! tool isn't installed, never because it failed, and never by switching to
//! a different scheme.

use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    process::{Command, Stdio},
    str::FromStr,
};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::{write::GzEncoder, Compression};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    ui::Ui,
    util::{find_executable, run_command_check_status, ToolError},
};

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("unsupported compression scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("no tool for {scheme} compression is installed (tried {tried})")]
    NoMechanism { scheme: CompressionScheme, tried: String },

    #[error("compressing {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("compressing with {program}")]
    Tool {
        program: String,
        #[source]
        source: ToolError,
    },

    #[error(
        "compressed output {path} ({compressed} bytes) is larger than its \
         input ({original} bytes)"
    )]
    Inflated { path: Utf8PathBuf, original: u64, compressed: u64 },

    #[error("compressing {input} produced an empty archive")]
    Empty { input: Utf8PathBuf },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionScheme {
    Gzip,
    Zip,
    SevenZip,
}

impl CompressionScheme {
    pub fn extension(self) -> &'static str {
        match self {
            CompressionScheme::Gzip => "gz",
            CompressionScheme::Zip => "zip",
            CompressionScheme::SevenZip => "7z",
        }
    }

    /// The mechanisms for this scheme, most preferred first.
    fn mechanisms(self) -> &'static [Mechanism] {
        use ArchiveKind::*;
        use Mechanism::*;

        match self {
            CompressionScheme::Gzip => &[
                External { program: "pigz", kind: GzipStream },
                External { program: "gzip", kind: GzipStream },
                InProcessGzip,
            ],
            CompressionScheme::Zip => &[
                External { program: "zip", kind: InfoZip },
                External { program: "7z", kind: SevenZipArchive("zip") },
            ],
            CompressionScheme::SevenZip => &[
                External { program: "7z", kind: SevenZipArchive("7z") },
                External { program: "7za", kind: SevenZipArchive("7z") },
                External { program: "7zz", kind: SevenZipArchive("7z") },
            ],
        }
    }
}

impl fmt::Display for CompressionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionScheme::Gzip => "gzip",
            CompressionScheme::Zip => "zip",
            CompressionScheme::SevenZip => "sevenZip",
        })
    }
}

impl FromStr for CompressionScheme {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(CompressionScheme::Gzip),
            "zip" => Ok(CompressionScheme::Zip),
            "sevenzip" | "7z" | "7zip" => Ok(CompressionScheme::SevenZip),
            _ => Err(CompressionError::UnsupportedScheme(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveKind {
    /// `<tool> -c <input> > <output>`
    GzipStream,

    /// `zip -j -q <output> <input>`
    InfoZip,

    /// `<tool> a -t<type> -bd -y <output> <input>`
    SevenZipArchive(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mechanism {
    External { program: &'static str, kind: ArchiveKind },
    InProcessGzip,
}

impl Mechanism {
    fn name(&self) -> &'static str {
        match self {
            Mechanism::External { program, .. } => *program,
            Mechanism::InProcessGzip => "built-in gzip",
        }
    }
}

/// Whether a scheme can be used on this machine, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Availability {
    /// The most preferred mechanism is available.
    Preferred(&'static str),

    /// Only a fallback mechanism is available.
    Fallback { preferred: &'static str, using: &'static str },

    Unavailable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompressedArtifact {
    pub path: Utf8PathBuf,
    pub scheme: CompressionScheme,
    pub mechanism: &'static str,
    pub original_size: u64,
    pub compressed_size: u64,

    /// `1 - compressed_size / original_size`.
    pub ratio: f64,
}

/// Returns the compression ratio, or `None` if compression made the data
/// larger or lost it entirely.
pub fn compression_ratio(original: u64, compressed: u64) -> Option<f64> {
    if compressed > original || (compressed == 0 && original > 0) {
        return None;
    }

    if original == 0 {
        return Some(0.0);
    }

    Some(1.0 - compressed as f64 / original as f64)
}

type Resolver = dyn Fn(&str) -> Option<Utf8PathBuf>;

pub struct Compressor {
    resolve: Box<Resolver>,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    /// A compressor that finds external tools in `PATH`.
    pub fn new() -> Self {
        Self::with_resolver(|program| find_executable(Utf8Path::new(program)))
    }

    pub fn with_resolver(
        resolve: impl Fn(&str) -> Option<Utf8PathBuf> + 'static,
    ) -> Self {
        Self { resolve: Box::new(resolve) }
    }

    fn select(
        &self,
        scheme: CompressionScheme,
    ) -> Option<(Mechanism, Option<Utf8PathBuf>)> {
        scheme.mechanisms().iter().find_map(|mechanism| match mechanism {
            Mechanism::External { program, .. } => {
                (self.resolve)(*program).map(|path| (*mechanism, Some(path)))
            }
            Mechanism::InProcessGzip => Some((*mechanism, None)),
        })
    }

    pub fn availability(&self, scheme: CompressionScheme) -> Availability {
        let preferred = scheme.mechanisms()[0].name();
        match self.select(scheme) {
            Some((mechanism, _)) if mechanism.name() == preferred => {
                Availability::Preferred(preferred)
            }
            Some((mechanism, _)) => {
                Availability::Fallback { preferred, using: mechanism.name() }
            }
            None => Availability::Unavailable,
        }
    }

    /// Compresses `input` into `<input>.<ext>` using the scheme named
    /// `scheme_name`, replacing any previous archive at that path.
    pub fn compress(
        &self,
        input: &Utf8Path,
        scheme_name: &str,
        ui: &dyn Ui,
    ) -> Result<CompressedArtifact, CompressionError> {
        let scheme: CompressionScheme = scheme_name.parse()?;
        let io_err = |path: &Utf8Path| {
            let path = path.to_owned();
            move |source| CompressionError::Io { path, source }
        };

        let original_size =
            std::fs::metadata(input).map_err(io_err(input))?.len();
        let output =
            Utf8PathBuf::from(format!("{input}.{}", scheme.extension()));

        // Archivers add to an existing archive instead of replacing it.
        if output.exists() {
            std::fs::remove_file(&output).map_err(io_err(&output))?;
        }

        let Some((mechanism, program)) = self.select(scheme) else {
            let tried = scheme
                .mechanisms()
                .iter()
                .map(Mechanism::name)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CompressionError::NoMechanism { scheme, tried });
        };

        ui.set_substep(&format!(
            "compressing {input} ({scheme} via {})",
            mechanism.name()
        ));

        let result = match (mechanism, program) {
            (Mechanism::External { kind, .. }, Some(program)) => {
                run_external(kind, &program, input, &output, ui)
            }
            _ => gzip_in_process(input, &output),
        };

        if let Err(e) = result {
            discard(&output);
            return Err(e);
        }

        let compressed_size =
            std::fs::metadata(&output).map_err(io_err(&output))?.len();
        let Some(ratio) = compression_ratio(original_size, compressed_size)
        else {
            discard(&output);
            return Err(if compressed_size == 0 {
                CompressionError::Empty { input: input.to_owned() }
            } else {
                CompressionError::Inflated {
                    path: output,
                    original: original_size,
                    compressed: compressed_size,
                }
            });
        };

        info!(
            %output,
            %scheme,
            mechanism = mechanism.name(),
            original_size,
            compressed_size,
            ratio,
            "compressed image"
        );

        Ok(CompressedArtifact {
            path: output,
            scheme,
            mechanism: mechanism.name(),
            original_size,
            compressed_size,
            ratio,
        })
    }
}

/// Removes an archive that won't be reported as an artifact.
fn discard(output: &Utf8Path) {
    if output.exists() {
        if let Err(e) = std::fs::remove_file(output) {
            warn!(%output, error = %e, "couldn't remove rejected archive");
        }
    }
}

fn run_external(
    kind: ArchiveKind,
    program: &Utf8Path,
    input: &Utf8Path,
    output: &Utf8Path,
    ui: &dyn Ui,
) -> Result<(), CompressionError> {
    let mut cmd = Command::new(program.as_std_path());
    match kind {
        ArchiveKind::GzipStream => {
            let out = File::create(output).map_err(|source| {
                CompressionError::Io { path: output.to_owned(), source }
            })?;
            cmd.args(["-c", input.as_str()]).stdout(Stdio::from(out));
        }
        ArchiveKind::InfoZip => {
            cmd.args(["-j", "-q", output.as_str(), input.as_str()]);
        }
        ArchiveKind::SevenZipArchive(archive_type) => {
            cmd.args([
                "a",
                &format!("-t{archive_type}"),
                "-bd",
                "-y",
                output.as_str(),
                input.as_str(),
            ]);
        }
    }

    run_command_check_status(&mut cmd, ui).map(|_| ()).map_err(|source| {
        CompressionError::Tool { program: program.to_string(), source }
    })
}

fn gzip_in_process(
    input: &Utf8Path,
    output: &Utf8Path,
) -> Result<(), CompressionError> {
    let io_err = |path: &Utf8Path| {
        let path = path.to_owned();
        move |source| CompressionError::Io { path, source }
    };

    let mut reader = BufReader::new(File::open(input).map_err(io_err(input))?);
    let writer = BufWriter::new(File::create(output).map_err(io_err(output))?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    std::io::copy(&mut reader, &mut encoder).map_err(io_err(output))?;
    encoder
        .finish()
        .and_then(|mut w| std::io::Write::flush(&mut w))
        .map_err(io_err(output))
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::ui::testing::ScriptedUi;

    fn no_tools() -> Compressor {
        Compressor::with_resolver(|_| None)
    }

    fn scratch_file(contents: &[u8]) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("win.raw")).unwrap();
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn scheme_names() {
        let parse = |name: &str| name.parse::<CompressionScheme>();
        assert_eq!(parse("gzip").unwrap(), CompressionScheme::Gzip);
        assert_eq!(parse("GZ").unwrap(), CompressionScheme::Gzip);
        assert_eq!(parse("sevenZip").unwrap(), CompressionScheme::SevenZip);
        assert_eq!(parse("7z").unwrap(), CompressionScheme::SevenZip);
        assert!(matches!(
            parse("lzma"),
            Err(CompressionError::UnsupportedScheme(name)) if name == "lzma"
        ));
    }

    #[test]
    fn ratio_bounds() {
        assert_eq!(compression_ratio(100, 25), Some(0.75));
        assert_eq!(compression_ratio(100, 100), Some(0.0));
        assert_eq!(compression_ratio(0, 0), Some(0.0));
        assert_eq!(compression_ratio(100, 101), None);
        assert_eq!(compression_ratio(0, 20), None);

        assert_eq!(compression_ratio(4096, 0), None);

        let samples = [(1u64, 1u64), (10, 9), (1 << 40, 1 << 20)];
        for (original, compressed) in samples {
            let ratio = compression_ratio(original, compressed).unwrap();
            assert!((0.0..1.0).contains(&ratio));
        }
    }

    #[test]
    fn gzip_falls_back_to_built_in_encoder() {
        let data = vec![0u8; 256 * 1024];
        let (_dir, input) = scratch_file(&data);
        let ui = ScriptedUi::default();

        let artifact = no_tools().compress(&input, "gzip", &ui).unwrap();
        assert_eq!(artifact.path, format!("{input}.gz"));
        assert_eq!(artifact.mechanism, "built-in gzip");
        assert_eq!(artifact.original_size, data.len() as u64);
        assert!(artifact.compressed_size <= artifact.original_size);
        assert!((0.0..1.0).contains(&artifact.ratio));

        let mut decoded = Vec::new();
        GzDecoder::new(File::open(&artifact.path).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn gzip_prefers_external_tools() {
        let (_dir, input) = scratch_file(&vec![7u8; 64 * 1024]);
        let Some(gzip) = find_executable(Utf8Path::new("gzip")) else {
            // Nothing to exercise on a machine without gzip.
            return;
        };

        let compressor = Compressor::with_resolver(move |program| {
            (program == "gzip").then(|| gzip.clone())
        });
        let artifact = compressor
            .compress(&input, "gzip", &ScriptedUi::default())
            .unwrap();
        assert_eq!(artifact.mechanism, "gzip");

        let mut magic = [0u8; 2];
        File::open(&artifact.path).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(magic, [0x1f, 0x8b]);
    }

    #[test]
    fn schemes_never_fall_back_to_other_schemes() {
        let (_dir, input) = scratch_file(&[0u8; 1024]);
        let err = no_tools()
            .compress(&input, "zip", &ScriptedUi::default())
            .unwrap_err();
        assert!(matches!(
            err,
            CompressionError::NoMechanism { scheme: CompressionScheme::Zip, .. }
        ));
        assert!(!Utf8PathBuf::from(format!("{input}.gz")).exists());
    }

    #[test]
    fn incompressible_input_is_rejected() {
        // A tiny file grows once the gzip header is added.
        let (_dir, input) = scratch_file(b"x");
        let err = no_tools()
            .compress(&input, "gzip", &ScriptedUi::default())
            .unwrap_err();
        assert!(matches!(err, CompressionError::Inflated { .. }));
        assert!(!Utf8PathBuf::from(format!("{input}.gz")).exists());
    }

    #[cfg(unix)]
    #[test]
    fn empty_archive_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, input) = scratch_file(&[3u8; 4096]);
        let script =
            Utf8PathBuf::from_path_buf(dir.path().join("pigz")).unwrap();
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        let executable = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&script, executable).unwrap();

        let compressor = Compressor::with_resolver(move |program| {
            (program == "pigz").then(|| script.clone())
        });
        let err = compressor
            .compress(&input, "gzip", &ScriptedUi::default())
            .unwrap_err();
        assert!(matches!(err, CompressionError::Empty { .. }));
        assert!(!Utf8PathBuf::from(format!("{input}.gz")).exists());
    }

    #[test]
    fn unsupported_scheme_names_the_scheme() {
        let (_dir, input) = scratch_file(&[0u8; 1024]);
        let err = no_tools()
            .compress(&input, "lzma", &ScriptedUi::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported compression scheme 'lzma'");
    }

    #[test]
    fn availability_reports_fallbacks() {
        assert_eq!(
            no_tools().availability(CompressionScheme::Gzip),
            Availability::Fallback { preferred: "pigz", using: "built-in gzip" }
        );
        assert_eq!(
            no_tools().availability(CompressionScheme::SevenZip),
            Availability::Unavailable
        );

        let everything = Compressor::with_resolver(|program| {
            Some(Utf8PathBuf::from(program))
        });
        assert_eq!(
            everything.availability(CompressionScheme::Zip),
            Availability::Preferred("zip")
        );
    }
}
