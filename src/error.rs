//! Error types for the resolution and build pipeline.
//!
//! Every variant names the stage that failed and the file, path or URL it
//! could not find or validate. [`Error::class`] maps variants onto the
//! operator-facing taxonomy (resolution / format / build / ...).

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage, used to prefix diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Cache,
    Acquire,
    Extract,
    ResolveVersion,
    LocateConfig,
    PrepareTree,
    BuildModule,
    BuildBinaries,
    Assemble,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Cache => "cache",
            Stage::Acquire => "release acquisition",
            Stage::Extract => "archive extraction",
            Stage::ResolveVersion => "version resolution",
            Stage::LocateConfig => "configuration lookup",
            Stage::PrepareTree => "kernel header preparation",
            Stage::BuildModule => "module build",
            Stage::BuildBinaries => "userspace build",
            Stage::Assemble => "package assembly",
            Stage::Package => "packaging",
        };
        f.write_str(name)
    }
}

/// Taxonomy bucket for an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing known for this version; fixable by operator action.
    Resolution,
    /// An archive or container failed integrity or format checks.
    Format,
    /// A compiler or kernel build step failed.
    Build,
    Network,
    Cancelled,
    Io,
    Config,
    Cache,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "{stage}: no download URL known for target version '{version}'\n  \
         remediation: add \"{version}\" = \"<url>\" to the [releases] table of the config file,\n  \
         or pass the release URL explicitly with --url <URL>"
    )]
    UnknownRelease { stage: Stage, version: String },

    #[error("{stage}: {path} is not a valid {expected}: {reason}")]
    Format {
        stage: Stage,
        path: PathBuf,
        expected: &'static str,
        reason: String,
    },

    #[error("{stage}: download of {url} failed: {reason}")]
    Network {
        stage: Stage,
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("{kind}:{key} from {url}: gave up after {attempts} attempt(s): {source}")]
    Download {
        kind: String,
        key: String,
        url: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("{stage}: container '{name}' not found in {archive}\n  layouts tried:\n{attempted}")]
    ContainerNotFound {
        stage: Stage,
        name: String,
        archive: PathBuf,
        attempted: String,
    },

    #[error(
        "{stage}: no kernel version directory (pattern '<digits>.') under {root}\n  probed:\n{probed}"
    )]
    NoKernelVersion {
        stage: Stage,
        root: PathBuf,
        probed: String,
    },

    #[error("{stage}: every source for {what} failed:\n{attempts}")]
    SourcesExhausted {
        stage: Stage,
        what: String,
        attempts: String,
    },

    #[error("{stage}: `{command}` failed ({status})\n{output}")]
    Command {
        stage: Stage,
        command: String,
        status: String,
        output: String,
    },

    #[error("{stage}: required file not found: {path}")]
    MissingFile { stage: Stage, path: PathBuf },

    #[error(
        "{stage}: prepared tree reports kernel release '{actual}', expected '{expected}' \
         (a module built here would not load)"
    )]
    ReleaseMismatch {
        stage: Stage,
        expected: String,
        actual: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cache: {0}")]
    Cache(String),

    #[error("run cancelled: {0}")]
    Cancelled(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::UnknownRelease { .. }
            | Error::ContainerNotFound { .. }
            | Error::NoKernelVersion { .. }
            | Error::SourcesExhausted { .. } => ErrorClass::Resolution,
            Error::Format { .. } => ErrorClass::Format,
            Error::Command { .. } | Error::MissingFile { .. } | Error::ReleaseMismatch { .. } => {
                ErrorClass::Build
            }
            Error::Network { .. } => ErrorClass::Network,
            Error::Download { source, .. } => source.class(),
            Error::Cancelled(_) => ErrorClass::Cancelled,
            Error::Io { .. } => ErrorClass::Io,
            Error::Config(_) => ErrorClass::Config,
            Error::Cache(_) => ErrorClass::Cache,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn format(
        stage: Stage,
        path: impl Into<PathBuf>,
        expected: &'static str,
        reason: impl fmt::Display,
    ) -> Self {
        Error::Format {
            stage,
            path: path.into(),
            expected,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// `.with_context()` for `io::Result`, mirroring the anyhow idiom used by the
/// binary while keeping the library's error typed.
pub trait IoResultExt<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| Error::io(f(), source))
    }
}
