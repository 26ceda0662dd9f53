use crate::cmd::is_stored;
use crate::context::{self, Bootstrap};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Revision to extract: a full or abbreviated commit hash, branch tip,
    /// or tag.
    pub rev: String,

    /// Destination directory; cleared of any pre-existing contents.
    pub dir: PathBuf,

    /// Look in the `-asserts` database instead of the plain one.
    #[clap(long)]
    pub asserts: bool,

    /// Extract without touching the database directory: runs the codec
    /// inside a sandbox instead of against the database directly. Slower,
    /// but safe to run concurrently with an in-progress build against the
    /// same database.
    #[clap(long)]
    pub read_only: bool,
}

/// 0 on success, 125 if `rev` isn't stored anywhere.
pub fn run(bootstrap: &Bootstrap, args: ExtractArgs) -> Result<i32> {
    let rev = bootstrap.mirror.lookup(&args.rev).context("resolving revision")?;
    let version = bootstrap
        .mirror
        .commit_version(&rev)
        .context("reading VERSION at revision")?;
    let db_name = context::database_name(version, args.asserts);
    let db = bootstrap.database(&db_name)?;

    let listing = db.list().context("listing database")?;
    if !is_stored(&listing, &rev) {
        eprintln!("{rev} is not stored in {db_name}");
        return Ok(125);
    }

    if args.read_only {
        let rootfs = bootstrap
            .rootfs_cache
            .ensure(
                context::ROOTFS_NAME,
                context::ROOTFS_SHA512,
                context::ROOTFS_LOOKASIDE_URL,
                context::ROOTFS_UPSTREAM_URL,
            )
            .context("fetching sandbox base image")?;
        db.extract_readonly(
            &rev,
            &args.dir,
            &bootstrap.runtime_binary()?,
            &bootstrap.config.sandbox_dir,
            &rootfs,
        )
        .context("extracting revision (read-only)")?;
    } else {
        db.extract(&rev, &args.dir).context("extracting revision")?;
    }
    Ok(0)
}
