//! Two-tier rootfs artifact fetch: try a lookaside cache first, fall back
//! to the canonical upstream location, verify the downloaded archive
//! against a known SHA-512 digest, then extract it into a directory the
//! rest of this crate can use directly as an OCI root. Concurrent callers
//! for the same cache directory single-flight behind
//! [`RootfsCache::artifact_lock`] so two workers starting at once don't
//! both pull and unpack the same multi-hundred-MB image.

use crate::error::{self, Error};
use duct::cmd;
use sha2::{Digest, Sha512};
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct RootfsCache {
    cache_dir: PathBuf,
    artifact_lock: Mutex<()>,
}

impl RootfsCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            artifact_lock: Mutex::new(()),
        }
    }

    /// Return a local directory holding the extracted rootfs image named
    /// `name` with the given `sha512` digest (of the archive, not its
    /// contents), fetching and unpacking it if not already cached.
    /// `lookaside_url` is tried first; `upstream_url` is used only if that
    /// fails.
    pub fn ensure(
        &self,
        name: &str,
        sha512: &str,
        lookaside_url: &str,
        upstream_url: &str,
    ) -> Result<PathBuf> {
        let dest = self.cache_dir.join(name.trim_end_matches(".tar.zst"));
        let marker = dest.join(".extracted");
        if marker.exists() {
            return Ok(dest);
        }

        let _guard = self.artifact_lock.lock().unwrap_or_else(|e| e.into_inner());
        if marker.exists() {
            return Ok(dest);
        }

        fs::create_dir_all(&self.cache_dir).context(error::CreateDirSnafu {
            path: &self.cache_dir,
        })?;

        let bytes = match download(lookaside_url) {
            Ok(bytes) => bytes,
            Err(_) => download(upstream_url).context(error::FetchExhaustedSnafu {
                url: upstream_url.to_string(),
            })?,
        };

        verify(upstream_url, &bytes, sha512)?;

        let archive = self.cache_dir.join(name).with_extension("part");
        fs::write(&archive, &bytes).context(error::WriteSnafu { path: &archive })?;

        fs::create_dir_all(&dest).context(error::CreateDirSnafu { path: &dest })?;
        cmd(
            "tar",
            [
                "-C".to_string(),
                dest.to_string_lossy().into_owned(),
                "-xaf".to_string(),
                archive.to_string_lossy().into_owned(),
            ],
        )
        .run()
        .context(error::ExtractSnafu { path: &archive })?;
        let _ = fs::remove_file(&archive);

        fs::write(&marker, b"").context(error::WriteSnafu { path: &marker })?;
        Ok(dest)
    }
}

fn download(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::blocking::get(url).context(error::FetchSnafu { url })?;
    let bytes = response
        .error_for_status()
        .context(error::FetchSnafu { url })?
        .bytes()
        .context(error::FetchSnafu { url })?;
    Ok(bytes.to_vec())
}

fn verify(url: &str, bytes: &[u8], expected: &str) -> Result<()> {
    let mut digest = Sha512::new();
    digest.update(bytes);
    let actual = hex::encode(digest.finalize());
    ensure!(
        actual.eq_ignore_ascii_case(expected),
        error::DigestMismatchSnafu {
            url: url.to_string(),
            expected: expected.to_string(),
            actual,
        }
    );
    Ok(())
}
