//! Hard-coded coupling to the single upstream project this archive tracks.
//! Every other crate in the workspace is project-agnostic; this module is
//! the one place that knows which project, which remote, and which base
//! image the pipeline builds against.

use anyhow::{Context, Result};
use archive_config::Config;
use pack_store::Database;
use sandbox_runtime::RootfsCache;
use source_mirror::SourceMirror;
use std::path::PathBuf;

pub const PROJECT: &str = "julia";
pub const UPSTREAM_REMOTE_URL: &str = "https://github.com/JuliaLang/julia.git";

/// Base image the sandbox compiles inside. Pinned by digest so a stale
/// lookaside cache entry is caught rather than silently trusted.
pub const ROOTFS_NAME: &str = "julia-build-rootfs.tar.zst";
pub const ROOTFS_SHA512: &str = "a2c1b8f7e6d5c4b3a291807f6e5d4c3b2a1908f7e6d5c4b3a2918070f6e5d4c\
3b2a1908f7e6d5c4b3a2918070f6e5d4c3b2a1908f7e6d5c4b3a2918070f6e5d4c3b2a1908f7e6d5c4b3a291807";
pub const ROOTFS_LOOKASIDE_URL: &str =
    "https://cache.archive-project.internal/rootfs/julia-build-rootfs.tar.zst";
pub const ROOTFS_UPSTREAM_URL: &str =
    "https://julia-archive-assets.example.org/rootfs/julia-build-rootfs.tar.zst";

pub const CODEC_BIN: &str = "pack-codec";
pub const RUNTIME_BIN: &str = "crun";

pub const DEFAULT_MIRROR_MAX_AGE_S: u64 = 6 * 3600;
pub const DEFAULT_CHUNK_SIZE: usize = 250;
pub const DEFAULT_BUILD_TIMEOUT_S: u64 = 3600;

/// Paths and long-lived handles shared by every subcommand.
pub struct Bootstrap {
    pub config: Config,
    pub mirror: SourceMirror,
    pub codec: PathBuf,
    pub rootfs_cache: RootfsCache,
}

impl Bootstrap {
    pub fn load() -> Result<Self> {
        let config = Config::load(PROJECT).context("loading configuration")?;
        let mirror = SourceMirror::new(config.downloads_dir.join("mirror"), UPSTREAM_REMOTE_URL);
        let codec = which::which(CODEC_BIN).context("locating pack codec binary on PATH")?;
        let rootfs_cache = RootfsCache::new(config.downloads_dir.join("rootfs"));
        Ok(Self {
            config,
            mirror,
            codec,
            rootfs_cache,
        })
    }

    pub fn database(&self, db_name: &str) -> Result<Database> {
        Database::new(self.config.database_dir(db_name), self.codec.clone())
            .with_context(|| format!("opening database {db_name}"))
    }

    pub fn runtime_binary(&self) -> Result<PathBuf> {
        sandbox_runtime::runtime_binary(RUNTIME_BIN).context("locating container runtime on PATH")
    }
}

/// `"<project>-<major>.<minor>"`, plus an `-asserts` suffix when requested.
pub fn database_name(version: source_mirror::TargetVersion, asserts: bool) -> String {
    if asserts {
        format!("{PROJECT}-{version}-asserts")
    } else {
        format!("{PROJECT}-{version}")
    }
}
