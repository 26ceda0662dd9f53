use snafu::Snafu;
use std::path::PathBuf;

/// Why a single commit's build did not produce a usable artifact. Distinct
/// from [`Error`]: this is an expected, per-commit outcome that a pack's
/// build loop catches and logs rather than propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BuildFailed,
    Timeout,
    SmokeTestFailed,
}

#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub reason: FailureReason,
    pub exit_code: i32,
    pub term_signal: i32,
    /// At most the last 100 lines of the build log.
    pub log: String,
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (exit {}, signal {})",
            self.reason, self.exit_code, self.term_signal
        )
    }
}

impl std::error::Error for BuildFailure {}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to materialize source for '{commit}': {source}"))]
    Checkout {
        commit: String,
        source: source_mirror::Error,
    },

    #[snafu(display("failed to create directory '{}': {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to write '{}': {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to copy '{}' to '{}': {source}", from.display(), to.display()))]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to prepare sandbox: {source}"))]
    Sandbox { source: sandbox_runtime::Error },

    #[snafu(display("failed to start build command: {source}"))]
    CommandStart { source: std::io::Error },

    #[snafu(display("failed to ingest build artifact into the pack store: {source}"))]
    Store { source: pack_store::Error },

    #[snafu(display("no CPU target string is known for architecture '{arch}'"))]
    UnknownArch { arch: String },

    #[snafu(display("build did not produce a usable artifact: {source}"))]
    Build { source: BuildFailure },
}
