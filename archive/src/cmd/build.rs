use crate::context::{self, Bootstrap};
use crate::versions;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Minor versions to build, e.g. `1.10`, `1.9+`, `1.8-1.10`. Defaults to
    /// the newest known version.
    pub versions: Vec<String>,

    /// Build with assertions and debug checks enabled.
    #[clap(long)]
    pub asserts: bool,

    /// Number of commits to build concurrently.
    #[clap(long, default_value_t = num_cpus::get())]
    pub jobs: usize,

    /// Number of compiler threads (`make -j`) per commit build.
    #[clap(long, default_value_t = num_cpus::get() as u32)]
    pub threads: u32,

    /// Scratch directory for in-progress source checkouts and install
    /// trees. Defaults to a subdirectory of the sandbox state root.
    #[clap(long)]
    pub work_dir: Option<PathBuf>,
}

pub fn run(bootstrap: &Bootstrap, args: BuildArgs) -> Result<i32> {
    bootstrap
        .mirror
        .update(context::DEFAULT_MIRROR_MAX_AGE_S, false)
        .context("refreshing source mirror")?;

    let branch_points = bootstrap
        .mirror
        .branch_commits()
        .context("enumerating release branch points")?;
    let known: Vec<_> = branch_points.keys().copied().collect();
    let newest = *known.iter().max().context("no known target versions")?;
    let targets = versions::resolve(&args.versions, &known)?;

    let work_root = args
        .work_dir
        .clone()
        .unwrap_or_else(|| bootstrap.config.sandbox_dir.join("build-work"));
    std::fs::create_dir_all(&work_root)
        .with_context(|| format!("creating {}", work_root.display()))?;

    let runtime_bin = bootstrap.runtime_binary()?;
    let arch = std::env::consts::ARCH.to_string();
    let srccache_lock = Mutex::new(());

    let mut any_version_failed = false;
    for version in targets {
        let branch_point = branch_points
            .get(&version)
            .context("missing branch point for requested version")?;
        let branch_name = bootstrap.mirror.branch_name(version, newest);
        let commits = bootstrap
            .mirror
            .commits(branch_point, &branch_name)
            .with_context(|| format!("enumerating commits for {version}"))?;

        let db_name = context::database_name(version, args.asserts);
        let db = bootstrap.database(&db_name)?;

        let ctx = builder::BuildContext {
            mirror: &bootstrap.mirror,
            rootfs_cache: &bootstrap.rootfs_cache,
            rootfs_name: context::ROOTFS_NAME,
            rootfs_sha512: context::ROOTFS_SHA512,
            rootfs_lookaside_url: context::ROOTFS_LOOKASIDE_URL,
            rootfs_upstream_url: context::ROOTFS_UPSTREAM_URL,
            runtime_bin: runtime_bin.clone(),
            sandbox_state_root: bootstrap.config.sandbox_dir.join(&db_name),
            srccache_dir: bootstrap.config.downloads_dir.join("srccache").join(&db_name),
            srccache_lock: &srccache_lock,
            arch: arch.clone(),
        };

        let summary = pack_planner::build_version(
            &ctx,
            &db,
            &bootstrap.mirror,
            context::PROJECT,
            &work_root.join(&db_name),
            &commits,
            context::DEFAULT_CHUNK_SIZE,
            args.jobs.max(1),
            args.threads.max(1),
            context::DEFAULT_BUILD_TIMEOUT_S,
            args.asserts,
            true,
        )
        .with_context(|| format!("building {db_name}"))?;

        let attempted: usize = summary.packs.iter().map(|(_, p)| p.attempted).sum();
        let built: usize = summary.packs.iter().map(|(_, p)| p.succeeded.len()).sum();
        let failed: usize = summary.packs.iter().map(|(_, p)| p.failed.len()).sum();
        log::info!("{db_name}: {built} commits built, {failed} failed, across {} packs", summary.packs.len());

        if attempted > 0 && built == 0 {
            log::error!("{db_name}: every attempted commit failed");
            any_version_failed = true;
        }
    }

    Ok(if any_version_failed { 1 } else { 0 })
}
