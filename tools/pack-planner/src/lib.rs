/*!
Partitions a target version's commit history into fixed-size packs and
drives their construction: per-pack drift detection, resuming a partially
built pack, bounded-parallel dispatch of [`builder::build_commit`], and
sequential finalization across packs.
*/

pub mod error;

use builder::BuildContext;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use pack_store::Database;
use snafu::ResultExt;
use source_mirror::SourceMirror;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

pub use error::Error;
type Result<T, E = Error> = std::result::Result<T, E>;

pub type Revision = String;
pub type PackName = String;

/// `"<project>-<pack_name>"`, sanitized, and the file stem a finalized
/// pack is stored under.
pub fn pack_file_name(project: &str, pack_name: &str) -> String {
    pack_store::safe_name(&format!("{project}-{pack_name}"))
}

/// Partition `commits` into consecutive chunks of at most `chunk_size`,
/// naming each chunk after its first commit. Deterministic and
/// prefix-stable: appending commits to the tip only ever appends new,
/// fully-formed chunks to the tail of the plan.
pub fn commit_packs(
    mirror: &SourceMirror,
    commits: &[Revision],
    chunk_size: usize,
) -> Result<Vec<(PackName, Vec<Revision>)>> {
    let mut plan = Vec::new();
    for chunk in commits.chunks(chunk_size.max(1)) {
        let first = &chunk[0];
        let name = mirror
            .commit_name(first)
            .context(error::CommitNameSnafu { commit: first.clone() })?;
        plan.push((name, chunk.to_vec()));
    }
    Ok(plan)
}

/// Outcome of attempting to build every not-yet-built commit in one pack.
#[derive(Debug, Default)]
pub struct PackBuildSummary {
    pub attempted: usize,
    pub succeeded: Vec<Revision>,
    pub failed: Vec<(Revision, builder::Error)>,
}

/// Build every commit in `chunk` that isn't already loose in `db`,
/// dispatching across a pool of `njobs` worker threads. Per-commit
/// failures are recorded in the summary rather than returned as an error:
/// a pack is finalized as-is even if some of its commits failed.
pub fn build_pack(
    ctx: &BuildContext<'_>,
    db: &Database,
    work_root: &Path,
    chunk: &[Revision],
    njobs: usize,
    nproc_per_build: u32,
    timeout_s: u64,
    asserts: bool,
    show_progress: bool,
) -> Result<PackBuildSummary> {
    let listing = db.list().context(error::StoreSnafu)?;

    // Drift check: any loose object outside this chunk means stale state
    // from an earlier, differently-scoped run. The codec can't delete
    // loose objects individually, so the only recovery is to discard all
    // of them.
    let drifted = listing.loose.iter().any(|rev| !chunk.contains(rev));
    if drifted {
        warn!("loose area contains commits outside the current chunk; discarding it");
        db.rm_loose().context(error::StoreSnafu)?;
    }

    // Resume point: skip everything up to and including the last loose
    // revision that's actually part of this chunk.
    let commits_to_build: Vec<Revision> = if drifted {
        chunk.to_vec()
    } else {
        let resume_from = chunk
            .iter()
            .rposition(|rev| listing.loose.contains(rev))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        chunk[resume_from..].to_vec()
    };

    let mut summary = PackBuildSummary {
        attempted: commits_to_build.len(),
        ..Default::default()
    };
    if commits_to_build.is_empty() {
        return Ok(summary);
    }

    let bar = show_progress.then(|| {
        let bar = ProgressBar::new(commits_to_build.len() as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    });

    let queue = Mutex::new(VecDeque::from(commits_to_build.clone()));
    let results: Mutex<Vec<(Revision, std::result::Result<(), builder::Error>)>> =
        Mutex::new(Vec::new());
    let width = njobs.max(1).min(commits_to_build.len());

    std::thread::scope(|scope| {
        for _ in 0..width {
            scope.spawn(|| loop {
                let commit = {
                    let mut q = queue.lock().unwrap_or_else(|e| e.into_inner());
                    q.pop_front()
                };
                let Some(commit) = commit else { break };

                let source_dir = work_root.join(&commit).join("src");
                let install_dir = work_root.join(&commit).join("install");
                let inputs = builder::BuildInputs {
                    commit: commit.clone(),
                    source_dir,
                    install_dir,
                    nproc: nproc_per_build,
                    timeout_s,
                    asserts,
                };

                let outcome = builder::build_commit(ctx, db, inputs);
                let _ = std::fs::remove_dir_all(work_root.join(&commit));

                if let Some(bar) = &bar {
                    bar.set_message(commit.clone());
                    bar.inc(1);
                }

                results
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((commit, outcome));
            });
        }
    });

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    for (commit, outcome) in results.into_inner().unwrap_or_else(|e| e.into_inner()) {
        match outcome {
            Ok(()) => summary.succeeded.push(commit),
            Err(e) => {
                warn!("build failed for {commit}: {e}");
                summary.failed.push((commit, e));
            }
        }
    }

    Ok(summary)
}

/// Outcome of building an entire target version's pack plan.
#[derive(Debug, Default)]
pub struct VersionBuildSummary {
    pub packs: Vec<(PackName, PackBuildSummary)>,
}

impl VersionBuildSummary {
    pub fn any_version_commit_failed(&self) -> bool {
        self.packs.iter().any(|(_, summary)| !summary.failed.is_empty())
    }
}

/// Enumerate the pack plan for `commits` and build each pack in order.
/// Every pack but the last is finalized (`pack` + `rm_loose`) once built;
/// the last pack is left loose so future commits at the tip can extend it
/// without unpacking.
#[allow(clippy::too_many_arguments)]
pub fn build_version(
    ctx: &BuildContext<'_>,
    db: &Database,
    mirror: &SourceMirror,
    project: &str,
    work_root: &Path,
    commits: &[Revision],
    chunk_size: usize,
    njobs: usize,
    nproc_per_build: u32,
    timeout_s: u64,
    asserts: bool,
    show_progress: bool,
) -> Result<VersionBuildSummary> {
    let plan = commit_packs(mirror, commits, chunk_size)?;
    let mut summary = VersionBuildSummary::default();

    for (i, (pack_name, chunk)) in plan.iter().enumerate() {
        let is_last = i + 1 == plan.len();
        let safe_name = pack_file_name(project, pack_name);

        let listing = db.list().context(error::StoreSnafu)?;
        if listing.packed.contains_key(&safe_name) {
            info!("pack {safe_name} already exists, skipping");
            continue;
        }

        let pack_summary = build_pack(
            ctx,
            db,
            work_root,
            chunk,
            njobs,
            nproc_per_build,
            timeout_s,
            asserts,
            show_progress,
        )?;

        if !is_last {
            db.pack(&safe_name).context(error::StoreSnafu)?;
            db.rm_loose().context(error::StoreSnafu)?;
        }

        summary.packs.push((pack_name.clone(), pack_summary));
    }

    Ok(summary)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_file_name_sanitizes() {
        assert_eq!(pack_file_name("julia", "1.10.5"), "julia-1.10.5");
        assert_eq!(pack_file_name("julia", "1.10!!"), "julia-1.10__");
    }

    #[test]
    fn chunking_matches_s2_scenario() {
        // S2: with chunk size 3 and 7 commits, the plan is
        // [c1,c2,c3], [c4,c5,c6], [c7].
        let commits: Vec<Revision> = (1..=7).map(|i| format!("c{i}")).collect();
        let chunks: Vec<Vec<Revision>> = commits.chunks(3).map(|c| c.to_vec()).collect();
        assert_eq!(
            chunks,
            vec![
                vec!["c1".to_string(), "c2".to_string(), "c3".to_string()],
                vec!["c4".to_string(), "c5".to_string(), "c6".to_string()],
                vec!["c7".to_string()],
            ]
        );
    }

    #[test]
    fn resume_point_skips_already_loose_prefix() {
        // S3: loose {c1,c2} of chunk [c1..c5] must resume at c3.
        let chunk: Vec<Revision> = (1..=5).map(|i| format!("c{i}")).collect();
        let loose = vec!["c1".to_string(), "c2".to_string()];
        let resume_from = chunk
            .iter()
            .rposition(|rev| loose.contains(rev))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        assert_eq!(&chunk[resume_from..], &["c3", "c4", "c5"]);
    }
}
