/*!
Small Linux-specific helpers shared by the sandbox runtime and the pack
store: walking a process's descendant tree for signal delivery, inspecting
`/etc/mtab` for the mount flags a bind mount's source carries, and probing
the running kernel's version for feature gating (e.g. whether overlayfs
supports `userxattr`).

None of this is portable; every function here assumes `/proc` and
`/etc/mtab` exist in the form the Linux kernel documents.
*/

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

pub use error::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

/// Send `sig` to every process in the tree rooted at `pid`, descendants
/// before the process itself. Tolerates processes that have already exited
/// (`ESRCH`) and `/proc` entries that have already vanished (`ENOENT`):
/// both are races inherent to walking a live process tree and are not
/// errors here.
pub fn recursive_kill(pid: i32, sig: Signal) -> Result<()> {
    for child in children_of(pid)? {
        recursive_kill(child, sig)?;
    }

    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(source) => Err(source).context(error::KillSnafu { pid }),
    }
}

/// Read every `/proc/<pid>/task/*/children` file and return the union of
/// the pids they list. Returns an empty list, rather than an error, if the
/// process has already exited.
fn children_of(pid: i32) -> Result<Vec<i32>> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = match fs::read_dir(&task_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(source).context(error::ReadDirSnafu { path: task_dir }),
    };

    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.context(error::ReadDirSnafu { path: &task_dir })?;
        let children_file = entry.path().join("children");
        let raw = match fs::read_to_string(&children_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(source).context(error::ReadFileSnafu { path: children_file }),
        };
        for token in raw.split_whitespace() {
            let child: i32 = token
                .parse()
                .ok()
                .context(error::ParsePidSnafu { value: token })?;
            children.push(child);
        }
    }
    Ok(children)
}

/// Look up the mount options in effect for the filesystem that contains
/// `path`, by reading `/etc/mtab` and matching the entry whose mount point
/// has the same device id as `path` itself. When more than one entry
/// matches (stacked mounts of the same device), the last one listed wins,
/// since `/etc/mtab` is append-ordered by mount time.
pub fn mount_info<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let target_dev = fs::metadata(path)
        .context(error::StatSnafu { path })?
        .dev();

    let mtab = fs::read_to_string("/etc/mtab").context(error::ReadFileSnafu {
        path: "/etc/mtab",
    })?;

    let mut found = None;
    for line in mtab.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let Some(mount_point) = fields.next() else {
            continue;
        };
        let _fstype = fields.next();
        let Some(options) = fields.next() else {
            continue;
        };

        let dev = match fs::metadata(mount_point) {
            Ok(meta) => meta.dev(),
            Err(_) => continue,
        };
        if dev == target_dev {
            found = Some(options.split(',').map(str::to_owned).collect());
        }
    }

    found.context(error::NoMountEntrySnafu { path })
}

lazy_static::lazy_static! {
    static ref KERNEL_VERSION_RE: Regex =
        Regex::new(r"^(\d+)\.(\d+)\.(\d+)-.*$").expect("static regex is valid");
}

/// `(major, minor, patch)` parsed from `uname -r`, tolerating the
/// distro-specific suffix (e.g. `-generic`, `-arch1-1`) that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

pub fn get_kernel_version() -> Result<KernelVersion> {
    let uts = nix::sys::utsname::uname().context(error::UnameSnafu)?;
    let release = uts.release().to_string_lossy().into_owned();
    let captures = KERNEL_VERSION_RE
        .captures(&release)
        .context(error::UnparsableReleaseSnafu { release: &release })?;

    let parse = |i: usize| -> Result<u64> {
        captures[i]
            .parse()
            .ok()
            .context(error::UnparsableReleaseSnafu { release: &release })
    };

    Ok(KernelVersion {
        major: parse(1)?,
        minor: parse(2)?,
        patch: parse(3)?,
    })
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("failed to signal pid {pid}: {source}"))]
        Kill { pid: i32, source: nix::errno::Errno },

        #[snafu(display("failed to read directory '{path}': {source}"))]
        ReadDir {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("failed to read '{}': {source}", path.display()))]
        ReadFile {
            path: std::path::PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("'{value}' is not a valid pid"))]
        ParsePid { value: String },

        #[snafu(display("failed to stat '{}': {source}", path.display()))]
        Stat {
            path: std::path::PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("no entry in /etc/mtab matches the filesystem containing '{}'", path.display()))]
        NoMountEntry { path: std::path::PathBuf },

        #[snafu(display("failed to read kernel version: {source}"))]
        Uname { source: nix::errno::Errno },

        #[snafu(display("could not parse kernel release '{release}'"))]
        UnparsableRelease { release: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kernel_version_regex_strips_vendor_suffix() {
        let caps = KERNEL_VERSION_RE.captures("5.15.0-91-generic").unwrap();
        assert_eq!(&caps[1], "5");
        assert_eq!(&caps[2], "15");
        assert_eq!(&caps[3], "0");
    }

    #[test]
    fn kernel_version_ordering() {
        let older = KernelVersion { major: 5, minor: 4, patch: 0 };
        let newer = KernelVersion { major: 5, minor: 11, patch: 2 };
        assert!(older < newer);
    }

    #[test]
    fn recursive_kill_on_exited_pid_is_not_an_error() {
        // A pid this large is extremely unlikely to be live; children_of must
        // treat the missing /proc entry as "no children" rather than erroring.
        let result = recursive_kill(i32::MAX - 1, Signal::SIGTERM);
        assert!(result.is_ok());
    }

    #[test]
    fn mount_info_finds_root_filesystem() {
        // Every Linux host has a root mount; this should resolve without error
        // regardless of how many filesystems are mounted underneath it.
        let options = mount_info("/").unwrap();
        assert!(!options.is_empty());
    }
}
