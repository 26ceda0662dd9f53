/*!
Builds an OCI bundle (rootfs reference, bind/overlay mounts, user-namespace
mappings, a tight capability set) and hands back the `argv` needed to run
it under an unprivileged container runtime. This crate never execs
anything itself — the caller runs the returned command through whatever
process-execution helper the rest of the pipeline already uses, so output
capture and error mapping stay uniform across the codebase.
*/

mod config;
pub mod error;
mod fetch;

pub use error::Error;
pub use fetch::RootfsCache;

use config::{env_lines, system_mounts, Capabilities, IdMapping, Linux, Mount, Namespace, OciConfig, Process, Rlimit, Root, User};
use log::debug;
use procutil::KernelVersion;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

type Result<T, E = Error> = std::result::Result<T, E>;

/// One entry of the caller-supplied mount map. The destination key it's
/// stored under carries the `:ro`/`:rw` suffix that selects between these
/// two variants.
#[derive(Debug, Clone)]
pub enum MountSpec {
    BindMount { source: PathBuf, writable: bool },
    OverlayMount {
        lower: PathBuf,
        upper: PathBuf,
        work: PathBuf,
    },
}

/// Everything needed to run one command inside the sandbox.
pub struct SandboxInvocation {
    pub command: Vec<String>,
    pub rootfs: PathBuf,
    pub mounts: BTreeMap<String, MountSpec>,
    pub env: BTreeMap<String, String>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: String,
    pub name: String,
}

/// The directories every bundle augments the caller's mount set with,
/// always writable, layered over the read-only rootfs.
const AUTO_OVERLAY_DESTINATIONS: &[&str] = &["/tmp", "/var", "/home", "/root", "/usr/local"];

/// Owns a bundle's workdir (`upper/`, `work/`, `bundle/`) and removes it on
/// drop, so a panicking or early-returning caller can't leak sandbox
/// state. Also holds the `argv` that invokes the container runtime.
pub struct SandboxHandle {
    workdir: PathBuf,
    pub argv: Vec<String>,
}

impl SandboxHandle {
    pub fn bundle_dir(&self) -> PathBuf {
        self.workdir.join("bundle")
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        // Overlay cleanup on kernels with the whiteout-permission bug
        // leaves files the current user can't remove without a chmod pass
        // first; best-effort, since we're already in a destructor.
        let _ = chmod_recursive_best_effort(&self.workdir);
        if let Err(e) = fs::remove_dir_all(&self.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove sandbox workdir {}: {e}", self.workdir.display());
            }
        }
    }
}

fn chmod_recursive_best_effort(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if !root.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(root).contents_first(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o777));
    }
    Ok(())
}

/// Resolve the path to the container runtime binary on `PATH`.
pub fn runtime_binary(name: &str) -> Result<PathBuf> {
    which::which(name).context(error::RuntimeNotFoundSnafu)
}

/// Build a bundle for `invocation` under `sandbox_state_root`, returning a
/// handle whose `argv` runs it via `runtime`.
pub fn build(
    runtime: &Path,
    sandbox_state_root: &Path,
    invocation: &SandboxInvocation,
) -> Result<SandboxHandle> {
    let workdir = tempfile::Builder::new()
        .prefix(&format!("{}-", invocation.name))
        .tempdir_in(ensure_dir(sandbox_state_root)?)
        .context(error::CreateDirSnafu {
            path: sandbox_state_root,
        })?
        .into_path();

    let bundle_dir = workdir.join("bundle");
    ensure_dir(&bundle_dir)?;

    let kernel = procutil::get_kernel_version().ok();
    let mut mounts = system_mounts();

    for destination in AUTO_OVERLAY_DESTINATIONS {
        mounts.push(overlay_mount(
            &workdir,
            destination,
            &invocation.rootfs.join(destination.trim_start_matches('/')),
            kernel,
        )?);
    }

    for (destination, spec) in &invocation.mounts {
        let dest_clean = destination
            .trim_end_matches(":ro")
            .trim_end_matches(":rw");
        match spec {
            MountSpec::BindMount { source, writable } => {
                mounts.push(bind_mount(dest_clean, source, *writable)?);
            }
            MountSpec::OverlayMount { lower, upper, work } => {
                ensure_dir(upper)?;
                ensure_dir(work)?;
                mounts.push(Mount {
                    destination: dest_clean.to_string(),
                    source: Some("overlay".into()),
                    fs_type: "overlay".into(),
                    options: overlay_options(lower, upper, work, kernel),
                });
            }
        }
    }

    let config = OciConfig {
        oci_version: "1.0.2",
        root: Root {
            path: invocation.rootfs.to_string_lossy().into_owned(),
            readonly: true,
        },
        mounts,
        process: Process {
            terminal: false,
            user: User {
                uid: invocation.uid,
                gid: invocation.gid,
            },
            args: invocation.command.clone(),
            env: env_lines(&invocation.env),
            cwd: invocation.cwd.clone(),
            capabilities: Capabilities::default(),
            rlimits: vec![Rlimit {
                kind: "RLIMIT_NOFILE",
                hard: 8192,
                soft: 8192,
            }],
            no_new_privileges: true,
        },
        hostname: invocation.name.clone(),
        linux: Linux {
            namespaces: ["pid", "ipc", "uts", "mount", "user"]
                .into_iter()
                .map(|kind| Namespace { kind })
                .collect(),
            uid_mappings: vec![IdMapping {
                host_id: invocation.uid,
                container_id: 0,
                size: 1,
            }],
            gid_mappings: vec![IdMapping {
                host_id: invocation.gid,
                container_id: 0,
                size: 1,
            }],
        },
    };

    let rendered = serde_json::to_string_pretty(&config).context(error::SerializeConfigSnafu)?;
    let config_path = bundle_dir.join("config.json");
    fs::write(&config_path, rendered).context(error::WriteSnafu { path: &config_path })?;

    debug!("prepared sandbox bundle at {}", bundle_dir.display());

    let argv = vec![
        runtime.to_string_lossy().into_owned(),
        "--root".into(),
        sandbox_state_root.to_string_lossy().into_owned(),
        "run".into(),
        "--bundle".into(),
        bundle_dir.to_string_lossy().into_owned(),
        invocation.name.clone(),
    ];

    Ok(SandboxHandle { workdir, argv })
}

fn ensure_dir(path: &Path) -> Result<&Path> {
    fs::create_dir_all(path).context(error::CreateDirSnafu { path })?;
    Ok(path)
}

fn bind_mount(destination: &str, source: &Path, writable: bool) -> Result<Mount> {
    let mut options = vec!["rbind".to_string()];
    options.push(if writable { "rw".into() } else { "ro".into() });

    if let Ok(flags) = procutil::mount_info(source) {
        for preserved in ["nodev", "nosuid", "noexec"] {
            if flags.iter().any(|f| f == preserved) {
                options.push(preserved.to_string());
            }
        }
    }

    Ok(Mount {
        destination: destination.to_string(),
        source: Some(source.to_string_lossy().into_owned()),
        fs_type: "none".into(),
        options,
    })
}

fn overlay_mount(
    workdir: &Path,
    destination: &str,
    lower: &Path,
    kernel: Option<KernelVersion>,
) -> Result<Mount> {
    let slug = destination.trim_start_matches('/').replace('/', "_");
    let upper = workdir.join("upper").join(&slug);
    let work = workdir.join("work").join(&slug);
    ensure_dir(&upper)?;
    ensure_dir(&work)?;

    Ok(Mount {
        destination: destination.to_string(),
        source: Some("overlay".into()),
        fs_type: "overlay".into(),
        options: overlay_options(lower, &upper, &work, kernel),
    })
}

fn overlay_options(lower: &Path, upper: &Path, work: &Path, kernel: Option<KernelVersion>) -> Vec<String> {
    let mut options = vec![
        format!("lowerdir={}", lower.display()),
        format!("upperdir={}", upper.display()),
        format!("workdir={}", work.display()),
        "xino=off".to_string(),
        "metacopy=off".to_string(),
        "index=off".to_string(),
        "redirect_dir=nofollow".to_string(),
    ];
    if let Some(kernel) = kernel {
        if kernel >= (KernelVersion { major: 5, minor: 11, patch: 0 }) {
            options.push("userxattr".to_string());
        }
    }
    options
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_mount_marks_writable() {
        let dir = tempfile::tempdir().unwrap();
        let mount = bind_mount("/source", dir.path(), true).unwrap();
        assert!(mount.options.contains(&"rw".to_string()));
        assert_eq!(mount.fs_type, "none");
    }

    #[test]
    fn overlay_options_add_userxattr_on_new_kernels() {
        let old = overlay_options(
            Path::new("/a"),
            Path::new("/b"),
            Path::new("/c"),
            Some(KernelVersion { major: 5, minor: 4, patch: 0 }),
        );
        assert!(!old.iter().any(|o| o == "userxattr"));

        let new = overlay_options(
            Path::new("/a"),
            Path::new("/b"),
            Path::new("/c"),
            Some(KernelVersion { major: 5, minor: 15, patch: 0 }),
        );
        assert!(new.iter().any(|o| o == "userxattr"));
    }

    #[test]
    fn build_produces_invokable_argv() {
        let workdir = tempfile::tempdir().unwrap();
        let state_root = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();

        let invocation = SandboxInvocation {
            command: vec!["/bin/true".to_string()],
            rootfs: rootfs.path().to_path_buf(),
            mounts: BTreeMap::new(),
            env: BTreeMap::new(),
            uid: 1000,
            gid: 1000,
            cwd: "/".to_string(),
            name: "test-sandbox".to_string(),
        };

        let handle = build(Path::new("/usr/bin/runc"), state_root.path(), &invocation).unwrap();
        assert!(handle.bundle_dir().join("config.json").exists());
        assert!(handle.argv.contains(&"--bundle".to_string()));
        drop(workdir);
    }
}
