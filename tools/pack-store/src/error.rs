use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to create directory '{}': {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to remove '{}': {source}", path.display()))]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to start '{}': {source}", program.display()))]
    CommandStart {
        program: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("pack codec exited non-zero running '{args}':\n{output}"))]
    Codec { args: String, output: String },

    #[snafu(display("metadata sidecar operation failed: {source}"))]
    Sidecar { source: metadata_sidecar::Error },

    #[snafu(display("failed to prepare read-only sandbox: {source}"))]
    Sandbox { source: sandbox_runtime::Error },
}
