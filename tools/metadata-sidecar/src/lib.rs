/*!
This crate fills the semantic gap between a real filesystem tree and what the
pack codec (see `pack-store`) is able to preserve on its own. The codec stores
regular file contents byte-for-byte, but it has no notion of permission bits
or symbolic links: everything it restores comes back as a plain file owned by
the extracting user.

Before an artifact directory is handed to the codec's `store` subcommand, we
walk it and record every mode and symlink target we find into a sidecar
`metadata.toml` at its root. After a commit is extracted, we walk the sidecar
back out: symlinks are (re-)created and modes are re-applied, and the sidecar
file itself is removed so it never leaks into a caller's tree.
*/

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use error::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

/// The name of the sidecar file written at the root of every artifact directory.
pub const METADATA_FILENAME: &str = "metadata.toml";

/// Modes and symlink targets captured from a directory tree, keyed by a
/// `./`-prefixed path relative to the tree's root.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Relative path -> POSIX mode, rendered as `"0o...".`
    #[serde(default)]
    pub modes: BTreeMap<String, String>,
    /// Relative path -> symlink target (unresolved, exactly as stored by `readlink`).
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

/// Walk `dir` and write a `metadata.toml` sidecar capturing every mode and
/// symlink in the tree. `dir` must not already contain a sidecar file.
pub fn prepare<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    let sidecar = dir.join(METADATA_FILENAME);
    ensure!(!sidecar.exists(), error::SidecarExistsSnafu { path: &sidecar });

    let mut metadata = Metadata::default();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
    {
        let entry = entry.context(error::WalkSnafu { dir })?;
        let rel = relative_key(dir, entry.path())?;
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target =
                fs::read_link(entry.path()).context(error::ReadLinkSnafu { path: entry.path() })?;
            metadata
                .links
                .insert(rel, target.to_string_lossy().into_owned());
            continue;
        }

        let meta = entry
            .metadata()
            .context(error::StatSnafu { path: entry.path() })?;
        metadata.modes.insert(rel, format_mode(meta.mode()));
    }

    let rendered = toml::to_string_pretty(&metadata).context(error::SerializeSnafu)?;
    fs::write(&sidecar, rendered).context(error::WriteSnafu { path: &sidecar })?;
    Ok(())
}

/// Apply a `metadata.toml` sidecar previously written by [`prepare`] to `dir`,
/// then remove the sidecar file. Symlinks that already exist with the
/// expected target are left alone; anything else at that path is an error.
pub fn unprepare<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    let sidecar = dir.join(METADATA_FILENAME);
    let raw = fs::read_to_string(&sidecar).context(error::ReadSnafu { path: &sidecar })?;
    let metadata: Metadata = toml::from_str(&raw).context(error::DeserializeSnafu { path: &sidecar })?;

    for (rel, target) in &metadata.links {
        let path = dir.join(strip_prefix(rel));
        match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
                }
                symlink(target, &path).context(error::SymlinkSnafu { path: &path })?;
            }
            Err(source) => return Err(source).context(error::StatSnafu { path: &path }),
            Ok(existing) => {
                ensure!(
                    existing.file_type().is_symlink(),
                    error::LinkOccupiedSnafu { path: &path }
                );
                let current =
                    fs::read_link(&path).context(error::ReadLinkSnafu { path: &path })?;
                ensure!(
                    current.to_string_lossy() == *target,
                    error::LinkMismatchSnafu {
                        path: &path,
                        expected: target.clone(),
                        found: current.to_string_lossy().into_owned(),
                    }
                );
            }
        }
    }

    for (rel, mode) in &metadata.modes {
        let path = dir.join(strip_prefix(rel));
        let mode = parse_mode(mode).context(error::ParseModeSnafu { value: mode.clone() })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode))
            .context(error::ChmodSnafu { path: &path })?;
    }

    fs::remove_file(&sidecar).context(error::RemoveSnafu { path: &sidecar })?;
    Ok(())
}

/// Render a POSIX mode the way the sidecar format expects: `"0o" + octal digits`.
fn format_mode(mode: u32) -> String {
    format!("0o{:o}", mode & 0o7777)
}

/// Parse a sidecar-format mode string back into a POSIX mode.
fn parse_mode(value: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    u32::from_str_radix(value.trim_start_matches("0o"), 8)
}

fn strip_prefix(rel: &str) -> &str {
    rel.strip_prefix("./").unwrap_or(rel)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .context(error::StripPrefixSnafu { path })?;
    Ok(format!("./{}", rel.to_string_lossy()))
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("'{}' already has a metadata sidecar", path.display()))]
        SidecarExists { path: PathBuf },

        #[snafu(display("failed to walk '{}': {source}", dir.display()))]
        Walk {
            dir: PathBuf,
            source: walkdir::Error,
        },

        #[snafu(display("failed to read symlink '{}': {source}", path.display()))]
        ReadLink {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to stat '{}': {source}", path.display()))]
        Stat {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to compute relative path for '{}': {source}", path.display()))]
        StripPrefix {
            path: PathBuf,
            source: std::path::StripPrefixError,
        },

        #[snafu(display("failed to serialize sidecar metadata: {source}"))]
        Serialize { source: toml::ser::Error },

        #[snafu(display("failed to write sidecar '{}': {source}", path.display()))]
        Write {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to read sidecar '{}': {source}", path.display()))]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to parse sidecar '{}': {source}", path.display()))]
        Deserialize {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("failed to create directory '{}': {source}", path.display()))]
        CreateDir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to create symlink '{}': {source}", path.display()))]
        Symlink {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display(
            "'{}' already exists and is not a symlink, expected one pointing at '{expected}'",
            path.display()
        ))]
        LinkOccupied { path: PathBuf },

        #[snafu(display(
            "'{}' is a symlink to '{found}', expected '{expected}'",
            path.display()
        ))]
        LinkMismatch {
            path: PathBuf,
            expected: String,
            found: String,
        },

        #[snafu(display("invalid mode '{value}': {source}"))]
        ParseMode {
            value: String,
            source: std::num::ParseIntError,
        },

        #[snafu(display("failed to chmod '{}': {source}", path.display()))]
        Chmod {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("failed to remove sidecar '{}': {source}", path.display()))]
        Remove {
            path: PathBuf,
            source: std::io::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mode_roundtrip() {
        assert_eq!(format_mode(0o100755), "0o100755");
        assert_eq!(parse_mode("0o100755").unwrap(), 0o100755);
        assert_eq!(parse_mode("0o644").unwrap(), 0o644);
    }

    #[test]
    fn prepare_then_unprepare_restores_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("bin/hello"), b"ABC").unwrap();
        fs::set_permissions(root.join("bin/hello"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(root.join("lib/libfoo.so.1"), b"bin").unwrap();
        fs::set_permissions(root.join("lib/libfoo.so.1"), fs::Permissions::from_mode(0o644))
            .unwrap();
        symlink("libfoo.so.1", root.join("lib/libfoo.so")).unwrap();

        prepare(root).unwrap();
        assert!(root.join(METADATA_FILENAME).exists());

        // Simulate the codec dropping the mode bits and the symlink across the trip:
        fs::set_permissions(root.join("bin/hello"), fs::Permissions::from_mode(0o644)).unwrap();
        fs::remove_file(root.join("lib/libfoo.so")).unwrap();

        unprepare(root).unwrap();
        assert!(!root.join(METADATA_FILENAME).exists());

        let hello_mode = fs::metadata(root.join("bin/hello")).unwrap().permissions().mode();
        assert_eq!(hello_mode & 0o7777, 0o755);

        let link_target = fs::read_link(root.join("lib/libfoo.so")).unwrap();
        assert_eq!(link_target, Path::new("libfoo.so.1"));

        assert_eq!(fs::read(root.join("bin/hello")).unwrap(), b"ABC");
    }

    #[test]
    fn unprepare_is_noop_on_already_correct_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("target"), b"x").unwrap();
        symlink("target", root.join("link")).unwrap();
        prepare(root).unwrap();
        // Symlink is already present and correct; unprepare must not error.
        unprepare(root).unwrap();
        assert_eq!(fs::read_link(root.join("link")).unwrap(), Path::new("target"));
    }

    #[test]
    fn prepare_rejects_existing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(METADATA_FILENAME), "").unwrap();
        let err = prepare(dir.path()).unwrap_err();
        assert!(matches!(err, Error::SidecarExists { .. }));
    }
}
