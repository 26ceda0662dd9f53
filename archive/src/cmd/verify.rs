use crate::context::{self, Bootstrap};
use crate::versions;
use anyhow::{Context, Result};
use clap::Args;
use std::collections::HashMap;

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Versions to verify. Defaults to every known version.
    pub versions: Vec<String>,

    /// Check the `-asserts` database instead of the plain one.
    #[clap(long)]
    pub asserts: bool,

    /// Delete any pack whose membership doesn't match the expected plan.
    #[clap(long)]
    pub fix: bool,
}

/// A pack is valid if every revision it claims is a member of the pack the
/// current plan would have put it in, and no revision appears in more than
/// one finalized pack. Partial packs (a strict subset of their expected
/// chunk) are accepted — future runs may still be filling them in.
pub fn run(bootstrap: &Bootstrap, args: VerifyArgs) -> Result<i32> {
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
    let targets = if args.versions.is_empty() {
        known.clone()
    } else {
        versions::resolve(&args.versions, &known)?
    };

    let mut all_valid = true;
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

        let plan = pack_planner::commit_packs(&bootstrap.mirror, &commits, context::DEFAULT_CHUNK_SIZE)
            .context("computing expected pack plan")?;
        let expected: HashMap<String, Vec<String>> = plan
            .into_iter()
            .map(|(name, revs)| (pack_planner::pack_file_name(context::PROJECT, &name), revs))
            .collect();

        let mut seen: HashMap<String, String> = HashMap::new();
        for (pack_name, members) in &listing.packed {
            let mut pack_valid = true;

            match expected.get(pack_name) {
                Some(expected_members) => {
                    for rev in members {
                        if !expected_members.contains(rev) {
                            log::error!("{db_name}: pack {pack_name} contains unexpected revision {rev}");
                            pack_valid = false;
                        }
                    }
                }
                None => {
                    log::error!("{db_name}: pack {pack_name} does not correspond to the current plan");
                    pack_valid = false;
                }
            }

            for rev in members {
                if let Some(other) = seen.insert(rev.clone(), pack_name.clone()) {
                    log::error!("{db_name}: revision {rev} present in both {other} and {pack_name}");
                    pack_valid = false;
                }
            }

            if !pack_valid {
                all_valid = false;
                if args.fix {
                    log::warn!("{db_name}: removing non-conforming pack {pack_name}");
                    db.remove_pack(pack_name).context("removing non-conforming pack")?;
                }
            }
        }
    }

    Ok(if all_valid { 0 } else { 1 })
}
