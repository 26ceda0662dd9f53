use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to name pack starting at '{commit}': {source}"))]
    CommitName {
        commit: String,
        source: source_mirror::Error,
    },

    #[snafu(display("pack store operation failed: {source}"))]
    Store { source: pack_store::Error },

    #[snafu(display("failed to create directory '{}': {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to remove directory '{}': {source}", path.display()))]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}
