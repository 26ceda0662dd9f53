//! `clap`-derived subcommand dispatch. Every subcommand module is a thin
//! caller of the library crates: the only logic living here is argument
//! parsing, wiring a [`crate::context::Bootstrap`] into the right core
//! components, and selecting an exit code.

pub mod build;
pub mod extract;
pub mod run;
pub mod status;
pub mod verify;

use clap::{Parser, Subcommand as ClapSubcommand};
use env_logger::Builder;
use log::LevelFilter;
use pack_store::Listing;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// Build-and-pack pipeline for historical revisions of the target project.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace].
    /// Defaults to info. You can also leave this unset and use the
    /// RUST_LOG env variable. See https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, ClapSubcommand)]
pub enum Subcommand {
    /// Build packs for the given minor versions.
    Build(build::BuildArgs),

    /// Extract and run the interpreter for a revision.
    Run(run::RunArgs),

    /// Extract a revision's install tree into a directory.
    Extract(extract::ExtractArgs),

    /// Validate stored packs against the expected commit plan.
    Verify(verify::VerifyArgs),

    /// Summarize available and unbuilt commits.
    Status(status::StatusArgs),
}

/// Use `level` if present, or else `RUST_LOG` if present, or else a
/// built-in default.
pub fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            Builder::from_default_env().init();
        }
        _ => {
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

/// Whether `rev` is present anywhere in `listing`, loose or packed.
pub(crate) fn is_stored(listing: &Listing, rev: &str) -> bool {
    listing.loose.iter().any(|r| r == rev) || listing.packed.values().any(|revs| revs.iter().any(|r| r == rev))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn is_stored_checks_loose_and_packed() {
        let mut packed = BTreeMap::new();
        packed.insert("pack-a".to_string(), vec!["ccc".to_string()]);
        let listing = Listing {
            loose: vec!["aaa".to_string()],
            packed,
        };
        assert!(is_stored(&listing, "aaa"));
        assert!(is_stored(&listing, "ccc"));
        assert!(!is_stored(&listing, "zzz"));
    }
}
