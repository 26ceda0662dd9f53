use crate::context::{self, Bootstrap};
use crate::versions;
use anyhow::{Context, Result};
use clap::Args;
use std::collections::HashSet;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Version to summarize. Defaults to the newest known version.
    pub version: Option<String>,

    /// Summarize the `-asserts` database instead of the plain one.
    #[clap(long)]
    pub asserts: bool,
}

pub fn run(bootstrap: &Bootstrap, args: StatusArgs) -> Result<i32> {
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

    let specs = args.version.clone().map(|v| vec![v]).unwrap_or_default();
    let targets = versions::resolve(&specs, &known)?;

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
        let listing = db.list().context("listing database")?;

        let built: HashSet<&String> = listing
            .loose
            .iter()
            .chain(listing.packed.values().flatten())
            .collect();
        let built_count = commits.iter().filter(|rev| built.contains(rev)).count();
        let unbuilt_count = commits.len() - built_count;

        println!(
            "{db_name}: {built_count}/{} built, {unbuilt_count} unbuilt, {} finalized packs",
            commits.len(),
            listing.packed.len()
        );
    }

    Ok(0)
}
