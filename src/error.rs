//! Error types for osforge.
//!
//! Core operations return [`Result<T>`]. The variants mirror the units of work
//! that can fail so a caller running many builds at once can always tell which
//! package, kernel or image a failure belongs to.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for osforge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the build core.
#[derive(Error, Debug)]
pub enum Error {
    /// A local source path, manifest reference or remote object does not exist.
    #[error("{what} not found: {location}")]
    NotFound { what: String, location: String },

    /// Downloaded bytes did not match the declared checksum.
    #[error("integrity check failed for {url}\n  expected sha256: {expected}\n  actual sha256:   {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    /// Transient network failure. Retried before it reaches the caller.
    #[error("fetching {url} failed after {attempts} attempt(s): {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// The package build tool exited non-zero.
    #[error("build of package '{package}' failed with exit code {exit_code} (fingerprint {fingerprint})")]
    Build {
        package: String,
        exit_code: i32,
        fingerprint: String,
    },

    /// A build finished but a later pipeline stage rejected its output.
    #[error("package '{package}' stage '{stage}' failed: {reason}")]
    BuildStage {
        package: String,
        stage: &'static str,
        reason: String,
    },

    /// Assembly was requested without artifacts for every manifest package.
    #[error("cannot assemble image, no artifacts for: {}", .missing.join(", "))]
    IncompleteManifest { missing: Vec<String> },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("kernel build failed at stage '{stage}': {reason}")]
    Kernel { stage: &'static str, reason: String },

    #[error("initrd build script {script} failed with exit code {exit_code}")]
    Initrd { script: PathBuf, exit_code: i32 },

    /// An external tool (mksquashfs, git, qemu-img, ...) failed.
    #[error("{program} exited with code {exit_code}{}", detail_suffix(.detail))]
    Command {
        program: String,
        exit_code: i32,
        detail: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("emulator exited with code {0}")]
    Emulator(i32),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>, location: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            location: location.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }

    /// Actionable hint for the CLI, when there is one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Integrity { .. } => Some(
                "The remote file may be corrupted or tampered with. Check the URL, or update the checksum if the manifest changed.",
            ),
            Self::IncompleteManifest { .. } => Some("Run `osforge build` first."),
            Self::Spawn { .. } => Some("Run `osforge status` to list missing host tools."),
            _ => None,
        }
    }
}

/// Attach context to `std::io::Result` values.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::io(context(), e))
    }
}
