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

    #[snafu(display("failed to serialize OCI config: {source}"))]
    SerializeConfig { source: serde_json::Error },

    #[snafu(display("failed to write '{}': {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("container runtime binary not found on PATH: {source}"))]
    RuntimeNotFound { source: which::Error },

    #[snafu(display("failed to remove sandbox workdir '{}': {source}", path.display()))]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to fetch rootfs from '{url}': {source}"))]
    Fetch {
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("rootfs fetch from both lookaside and upstream failed; last error fetching '{url}': {source}"))]
    FetchExhausted {
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "rootfs artifact at '{url}' has digest {actual}, expected {expected}"
    ))]
    DigestMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[snafu(display("failed to extract rootfs archive '{}': {source}", path.display()))]
    Extract {
        path: PathBuf,
        source: std::io::Error,
    },
}
