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

    #[snafu(display("failed to start '{command}': {source}"))]
    CommandStart {
        command: String,
        source: std::io::Error,
    },

    #[snafu(display("'{command}' failed:\n{output}"))]
    GitFailed { command: String, output: String },

    #[snafu(display("'{revision}' does not name a commit in the mirror"))]
    RevisionUnknown { revision: String },

    #[snafu(display("failed to stat '{}': {source}", path.display()))]
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("'{rev}' has no VERSION blob"))]
    NoVersionFile { rev: String },

    #[snafu(display("could not parse VERSION contents '{contents}' as semver: {source}"))]
    ParseVersion {
        contents: String,
        source: semver::Error,
    },

    #[snafu(display("could not parse blame output for VERSION at '{rev}'"))]
    UnparsableBlame { rev: String },

    #[snafu(display("could not parse commit count for '{rev}'"))]
    UnparsableCount { rev: String },
}
