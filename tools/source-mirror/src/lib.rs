/*!
A bare mirror of the target project's upstream repository, kept at a fixed
path under the downloads cache. This crate owns every bit of `git` plumbing
the rest of the pipeline needs: cloning on first use, refreshing on a
cadence, resolving user-facing revision specs to full hashes, and handing
out detached working trees for the builder to compile from.

Nothing here mutates the mirror's visible branch set on the caller's
behalf; `checkout` hands back a working tree via `git worktree`, which
tracks its own administrative state without touching `refs/heads/*`.
*/

pub mod error;

use duct::cmd;
use log::{debug, info};
use regex::Regex;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub use error::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

/// A 40-hex-char commit identifier.
pub type Revision = String;

/// An upstream release line, e.g. `1.10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetVersion {
    pub major: u64,
    pub minor: u64,
}

impl std::fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

lazy_static::lazy_static! {
    static ref BLAME_COMMIT_RE: Regex = Regex::new(r"(?m)^([0-9a-f]{40})\s").expect("static regex is valid");
}

pub struct SourceMirror {
    repo_path: PathBuf,
    remote_url: String,
    lock: Mutex<()>,
}

impl SourceMirror {
    /// Describe (but do not yet create) a mirror at `repo_path` of
    /// `remote_url`. Call [`SourceMirror::update`] to materialize it.
    pub fn new(repo_path: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote_url: remote_url.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn ensure_cloned(&self) -> Result<()> {
        if self.repo_path.join("HEAD").exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.repo_path).context(error::CreateDirSnafu {
            path: &self.repo_path,
        })?;
        self.git(&["init", "--bare", "."])?;
        self.git(&["remote", "add", "origin", &self.remote_url])?;
        info!("cloning {} into {}", self.remote_url, self.repo_path.display());
        self.git(&[
            "fetch",
            "origin",
            "+refs/heads/master:refs/heads/master",
            "+refs/heads/release-*:refs/heads/release-*",
        ])?;
        Ok(())
    }

    /// Refresh the mirror if `FETCH_HEAD` is older than `max_age_s` or
    /// `force` is set. Double-checked: a second caller blocked on the lock
    /// while a first caller just refreshed will observe the fresh mtime and
    /// skip its own fetch.
    pub fn update(&self, max_age_s: u64, force: bool) -> Result<()> {
        self.ensure_cloned()?;

        if !force && !self.fetch_head_is_stale(max_age_s)? {
            return Ok(());
        }

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if !force && !self.fetch_head_is_stale(max_age_s)? {
            return Ok(());
        }

        // `git gc --auto` leaves this file behind after a failed run and
        // refuses to retry gc until it's gone; a stuck gc.log should not
        // block ordinary fetches.
        let gc_log = self.repo_path.join("gc.log");
        if gc_log.exists() {
            let _ = fs::remove_file(&gc_log);
        }

        debug!("fetching {}", self.remote_url);
        self.git(&[
            "fetch",
            "origin",
            "+refs/heads/master:refs/heads/master",
            "+refs/heads/release-*:refs/heads/release-*",
        ])?;
        Ok(())
    }

    fn fetch_head_is_stale(&self, max_age_s: u64) -> Result<bool> {
        let fetch_head = self.repo_path.join("FETCH_HEAD");
        let meta = match fs::metadata(&fetch_head) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(source) => return Err(source).context(error::StatSnafu { path: fetch_head }),
        };
        let age = meta
            .modified()
            .context(error::StatSnafu { path: &fetch_head })?
            .elapsed()
            .unwrap_or(Duration::ZERO);
        Ok(age > Duration::from_secs(max_age_s))
    }

    /// Whether `rev` names an object the mirror already has.
    pub fn verify(&self, rev: &str) -> Result<bool> {
        self.ensure_cloned()?;
        Ok(self
            .git_unchecked(&["cat-file", "-e", &format!("{rev}^{{commit}}")])?
            .0
            .success())
    }

    /// Resolve `rev` (a branch tip, tag, short hash, or full hash) to a full
    /// 40-char hash. Tracked branch tips force a refresh first, since a
    /// caller asking for `master` wants the latest commit, not a stale one;
    /// any resolution failure also forces a refresh and is retried once, in
    /// case the revision just hasn't been fetched yet.
    pub fn lookup(&self, rev: &str) -> Result<Revision> {
        self.ensure_cloned()?;

        if rev == "master" || rev.starts_with("release-") {
            self.update(0, true)?;
        }

        match self.resolve(rev) {
            Ok(hash) => Ok(hash),
            Err(_) => {
                self.update(0, true)?;
                self.resolve(rev)
            }
        }
    }

    fn resolve(&self, rev: &str) -> Result<Revision> {
        let (status, stdout) = self.git_unchecked(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])?;
        ensure!(status.success(), error::RevisionUnknownSnafu { revision: rev });
        Ok(stdout.trim().to_string())
    }

    /// Materialize a detached working tree for `rev` at `dir`. Uses
    /// `git worktree add --detach`, which leaves the mirror's branch refs
    /// untouched.
    pub fn checkout(&self, rev: &str, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
        }
        self.git(&[
            "worktree",
            "add",
            "--detach",
            "--force",
            &dir.to_string_lossy(),
            rev,
        ])?;
        Ok(())
    }

    /// Parse the semantic version recorded in `rev`'s `VERSION` file,
    /// keeping only the `(major, minor)` pair.
    pub fn commit_version(&self, rev: &str) -> Result<TargetVersion> {
        let contents = self.version_file_at(rev)?;
        let version = semver::Version::parse(contents.trim())
            .context(error::ParseVersionSnafu { contents: contents.clone() })?;
        Ok(TargetVersion {
            major: version.major,
            minor: version.minor,
        })
    }

    /// `"<VERSION>.<count>"`, a human-readable label for a pack whose first
    /// commit is `rev`. `count` is the number of commits reachable from
    /// `rev` but not from the commit that last touched line 1 of `VERSION`.
    pub fn commit_name(&self, rev: &str) -> Result<String> {
        let version = self.version_file_at(rev)?;
        let blame_commit = self.blame_line_one(rev)?;
        let count = self.rev_list_count(rev, &blame_commit)?;
        Ok(format!("{}.{}", version.trim(), count))
    }

    /// Walk backward from `master`: at each step take the commit that last
    /// modified line 1 of `VERSION`, then move to that commit's parent and
    /// repeat, recording the branch-point commit per version encountered.
    /// Stops once version `1.6` has been recorded, matching the oldest
    /// release line the pipeline still serves.
    pub fn branch_commits(&self) -> Result<BTreeMap<TargetVersion, Revision>> {
        self.ensure_cloned()?;
        let mut result = BTreeMap::new();
        let mut cursor = self.resolve("master")?;

        loop {
            let branch_point = self.blame_line_one(&cursor)?;
            let version = self.commit_version(&branch_point)?;
            result.entry(version).or_insert_with(|| branch_point.clone());

            if version.major == 1 && version.minor == 6 {
                break;
            }

            let parent = self.git(&["rev-parse", &format!("{branch_point}^")])?;
            cursor = parent.trim().to_string();
        }

        Ok(result)
    }

    /// `"master"` for the newest known version; `"release-<major>.<minor>"`
    /// otherwise.
    pub fn branch_name(&self, v: TargetVersion, newest: TargetVersion) -> String {
        if v == newest {
            "master".to_string()
        } else {
            format!("release-{}.{}", v.major, v.minor)
        }
    }

    /// Topologically ordered (oldest first) revisions in
    /// `branch_point..branch_name`, filtering out any commit lacking a
    /// `VERSION` blob (foreign history merged in defensively).
    pub fn commits(&self, branch_point: &str, branch_name: &str) -> Result<Vec<Revision>> {
        self.ensure_cloned()?;
        let range = format!("{branch_point}..{branch_name}");
        let stdout = self.git(&["rev-list", "--reverse", "--topo-order", &range])?;

        let mut revisions = Vec::new();
        for rev in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.version_file_at(rev).is_ok() {
                revisions.push(rev.to_string());
            }
        }
        Ok(revisions)
    }

    fn version_file_at(&self, rev: &str) -> Result<String> {
        let (status, stdout) = self.git_unchecked(&["show", &format!("{rev}:VERSION")])?;
        ensure!(status.success(), error::NoVersionFileSnafu { rev });
        Ok(stdout)
    }

    fn blame_line_one(&self, rev: &str) -> Result<Revision> {
        let output = self.git(&["blame", "-L1,1", "--porcelain", rev, "--", "VERSION"])?;
        let captures = BLAME_COMMIT_RE
            .captures(&output)
            .context(error::UnparsableBlameSnafu { rev })?;
        Ok(captures[1].to_string())
    }

    fn rev_list_count(&self, rev: &str, exclude_ancestors_of: &str) -> Result<usize> {
        let range = format!("{rev}\n^{exclude_ancestors_of}");
        let output = self.git_stdin(&["rev-list", "--count", "--stdin"], &range)?;
        output
            .trim()
            .parse()
            .ok()
            .context(error::UnparsableCountSnafu { rev })
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let (status, stdout) = self.git_unchecked(args)?;
        ensure!(
            status.success(),
            error::GitFailedSnafu {
                command: args.join(" "),
                output: stdout,
            }
        );
        Ok(stdout)
    }

    fn git_unchecked(&self, args: &[&str]) -> Result<(std::process::ExitStatus, String)> {
        let output = cmd("git", args)
            .dir(&self.repo_path)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .context(error::CommandStartSnafu {
                command: args.join(" "),
            })?;
        Ok((output.status, String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn git_stdin(&self, args: &[&str], stdin: &str) -> Result<String> {
        let output = cmd("git", args)
            .dir(&self.repo_path)
            .stdin_bytes(stdin.as_bytes().to_vec())
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .context(error::CommandStartSnafu {
                command: args.join(" "),
            })?;
        ensure!(
            output.status.success(),
            error::GitFailedSnafu {
                command: args.join(" "),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            }
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::process::Command;

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            assert!(Command::new("git")
                .args(args)
                .current_dir(dir)
                .status()
                .unwrap()
                .success());
        };
        run(&["init", "--initial-branch=master"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
    }

    #[test]
    fn target_version_display_and_ordering() {
        let a = TargetVersion { major: 1, minor: 6 };
        let b = TargetVersion { major: 1, minor: 10 };
        assert_eq!(a.to_string(), "1.6");
        assert!(a < b);
    }

    #[test]
    fn branch_name_picks_master_for_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = SourceMirror::new(dir.path().join("mirror"), "https://example.invalid/repo.git");
        let newest = TargetVersion { major: 1, minor: 10 };
        let older = TargetVersion { major: 1, minor: 9 };
        assert_eq!(mirror.branch_name(newest, newest), "master");
        assert_eq!(mirror.branch_name(older, newest), "release-1.9");
    }

    #[test]
    fn commit_version_parses_version_file() {
        let src = tempfile::tempdir().unwrap();
        init_repo(src.path());
        fs::write(src.path().join("VERSION"), "1.10.5\n").unwrap();
        Command::new("git")
            .args(["add", "VERSION"])
            .current_dir(src.path())
            .status()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "add VERSION"])
            .current_dir(src.path())
            .status()
            .unwrap();

        let mirror_dir = tempfile::tempdir().unwrap();
        let mirror = SourceMirror::new(mirror_dir.path().join("mirror"), src.path().to_string_lossy());
        mirror.ensure_cloned().unwrap();
        mirror
            .git(&[
                "fetch",
                "origin",
                "+refs/heads/master:refs/heads/master",
            ])
            .unwrap();

        let rev = mirror.resolve("master").unwrap();
        let version = mirror.commit_version(&rev).unwrap();
        assert_eq!(version, TargetVersion { major: 1, minor: 10 });
    }
}
