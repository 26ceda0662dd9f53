/*!
Drives a single commit through the full build pipeline: materialize its
source tree, seed the source-dependency cache, compile inside a sandbox,
smoke-test the result, trim docs, and hand the artifact to the pack store.

Concurrency is the caller's responsibility — the pack planner invokes
[`build_commit`] from a bounded worker pool, one call per commit.
*/

pub mod error;

use duct::cmd;
use log::{info, warn};
use pack_store::Database;
use sandbox_runtime::{MountSpec, RootfsCache, SandboxInvocation};
use snafu::{OptionExt, ResultExt};
use source_mirror::SourceMirror;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub use error::{BuildFailure, Error, FailureReason};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Arch-specific `JULIA_CPU_TARGET` strings, required verbatim to keep
/// inter-commit binaries similar enough for pack-level delta compression
/// to pay off.
const CPU_TARGETS: &[(&str, &str)] = &[
    ("x86_64", "generic;sandybridge,-xsaveopt,clone_all;haswell,-rdrnd,base(1)"),
    ("i686", "pentium4;sandybridge,-xsaveopt,clone_all"),
    ("armv7l", "armv7-a;armv7-a,neon;armv7-a,neon,vfp4"),
    ("aarch64", "generic;cortex-a57;thunderx2t99;carmel"),
    ("powerpc64le", "pwr8"),
];

fn cpu_target(arch: &str) -> Result<&'static str> {
    CPU_TARGETS
        .iter()
        .find(|(a, _)| *a == arch)
        .map(|(_, target)| *target)
        .context(error::UnknownArchSnafu { arch })
}

/// Inputs for a single commit's build. `source_dir` and `install_dir` must
/// both be empty on entry; the builder owns their full lifecycle.
pub struct BuildInputs {
    pub commit: String,
    pub source_dir: PathBuf,
    pub install_dir: PathBuf,
    pub nproc: u32,
    pub timeout_s: u64,
    pub asserts: bool,
}

impl Default for BuildInputs {
    fn default() -> Self {
        Self {
            commit: String::new(),
            source_dir: PathBuf::new(),
            install_dir: PathBuf::new(),
            nproc: 1,
            timeout_s: 3600,
            asserts: false,
        }
    }
}

/// Shared, long-lived context a worker pool hands to every [`build_commit`]
/// call. `srccache_lock` single-flights the shared-cache population step
/// across concurrently building commits.
pub struct BuildContext<'a> {
    pub mirror: &'a SourceMirror,
    pub rootfs_cache: &'a RootfsCache,
    pub rootfs_name: &'a str,
    pub rootfs_sha512: &'a str,
    pub rootfs_lookaside_url: &'a str,
    pub rootfs_upstream_url: &'a str,
    pub runtime_bin: PathBuf,
    pub sandbox_state_root: PathBuf,
    pub srccache_dir: PathBuf,
    pub srccache_lock: &'a Mutex<()>,
    pub arch: String,
}

/// Run the full pipeline for one commit and deposit the result into `db`
/// under `rev`. On a [`FailureReason`] outcome this returns
/// `Err(Error::Build)`; the caller (the pack planner's build loop) is
/// expected to log that case and move on rather than abort the pack.
pub fn build_commit(ctx: &BuildContext, db: &Database, inputs: BuildInputs) -> Result<()> {
    fs::create_dir_all(&inputs.source_dir).context(error::CreateDirSnafu {
        path: &inputs.source_dir,
    })?;
    fs::create_dir_all(&inputs.install_dir).context(error::CreateDirSnafu {
        path: &inputs.install_dir,
    })?;

    ctx.mirror
        .checkout(&inputs.commit, &inputs.source_dir)
        .context(error::CheckoutSnafu {
            commit: inputs.commit.clone(),
        })?;

    let rootfs = ctx
        .rootfs_cache
        .ensure(
            ctx.rootfs_name,
            ctx.rootfs_sha512,
            ctx.rootfs_lookaside_url,
            ctx.rootfs_upstream_url,
        )
        .context(error::SandboxSnafu)?;

    if let Err(e) = populate_srccache(ctx, &rootfs, &inputs.commit, &inputs.source_dir) {
        warn!("srccache population failed for {}: {e}", inputs.commit);
    }

    write_make_user(&ctx.arch, &inputs)?;

    let outcome = run_sandboxed_build(ctx, &rootfs, &inputs);
    match outcome {
        Ok(()) => {}
        Err(failure) => return Err(Error::Build { source: failure }),
    }

    if let Err(failure) = smoke_test(&inputs) {
        return Err(Error::Build { source: failure });
    }

    trim(&inputs.install_dir)?;

    db.store(&inputs.commit, &inputs.install_dir)
        .context(error::StoreSnafu)?;

    info!("built and stored {}", inputs.commit);
    Ok(())
}

/// Copy the shared source-dependency cache into the checkout, run
/// `make -C deps getall` inside the same sandbox the real build uses to
/// fetch anything new, then copy new entries back. Failures here are
/// logged by the caller and never fatal to the build: a missing cache
/// entry just means the real build's `make` fetches it for real.
fn populate_srccache(ctx: &BuildContext, rootfs: &Path, commit: &str, source_dir: &Path) -> Result<()> {
    let _guard = ctx.srccache_lock.lock().unwrap_or_else(|e| e.into_inner());

    let dest = source_dir.join("deps/srccache");
    fs::create_dir_all(&dest).context(error::CreateDirSnafu { path: &dest })?;

    if ctx.srccache_dir.exists() {
        copy_tree(&ctx.srccache_dir, &dest)?;
    }

    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/source:rw".to_string(),
        MountSpec::BindMount {
            source: source_dir.to_path_buf(),
            writable: true,
        },
    );

    let invocation = SandboxInvocation {
        command: vec![
            "make".to_string(),
            "-C".to_string(),
            "deps".to_string(),
            "getall".to_string(),
            "NO_GIT=1".to_string(),
        ],
        rootfs: rootfs.to_path_buf(),
        mounts,
        env: BTreeMap::new(),
        uid: 1000,
        gid: 1000,
        cwd: "/source".to_string(),
        name: format!("srccache-{}", &commit[..12.min(commit.len())]),
    };

    let handle = sandbox_runtime::build(&ctx.runtime_bin, &ctx.sandbox_state_root, &invocation)
        .context(error::SandboxSnafu)?;

    let output = cmd(&handle.argv[0], &handle.argv[1..])
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .run()
        .context(error::CommandStartSnafu)?;

    if !output.status.success() {
        warn!(
            "`make -C deps getall` exited non-zero; continuing with what's cached:\n{}",
            String::from_utf8_lossy(&output.stdout)
        );
    }

    fs::create_dir_all(&ctx.srccache_dir).context(error::CreateDirSnafu {
        path: &ctx.srccache_dir,
    })?;
    copy_tree(&dest, &ctx.srccache_dir)?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let Ok(entry) = entry else { continue };
        let rel = entry.path().strip_prefix(from).expect("entry under from");
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context(error::CreateDirSnafu { path: &target })?;
        } else if entry.file_type().is_file() && !target.exists() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
            }
            fs::copy(entry.path(), &target).context(error::CopySnafu {
                from: entry.path(),
                to: &target,
            })?;
        }
    }
    Ok(())
}

fn write_make_user(arch: &str, inputs: &BuildInputs) -> Result<()> {
    let target = cpu_target(arch)?;
    let mut contents = format!(
        "JULIA_CPU_TARGET={target}\n\
         CFLAGS=-ffunction-sections -fdata-sections\n\
         CXXFLAGS=-ffunction-sections -fdata-sections\n"
    );
    if inputs.asserts {
        contents.push_str("FORCE_ASSERTIONS=1\nLLVM_ASSERTIONS=1\n");
    }

    let path = inputs.source_dir.join("Make.user");
    fs::write(&path, contents).context(error::WriteSnafu { path })
}

/// The fixed build script run inside the sandbox: stub `gfortran` (only
/// its version is ever probed), patch the checksum tool to tolerate a bad
/// upstream checksum, disable the doc build, and run the real build.
const BUILD_SCRIPT: &str = r#"
set -eu
cat > /usr/local/bin/gfortran <<'EOS'
#!/bin/sh
echo "GNU Fortran (GCC) 11.0.0"
EOS
chmod +x /usr/local/bin/gfortran
sed -i 's/exit 1/: # checksum mismatch tolerated/' /source/deps/tools/jlchecksum || true
printf 'default:\n\ttrue\n' > /source/doc/Makefile
mkdir -p /source/doc/_build/html
touch /source/doc/_build/html/.empty
cd /source
make -j"${NPROC}" binary-dist
mkdir -p /install
mv julia-*/* /install/
"#;

fn run_sandboxed_build(
    ctx: &BuildContext,
    rootfs: &Path,
    inputs: &BuildInputs,
) -> std::result::Result<(), BuildFailure> {
    let mut mounts = BTreeMap::new();
    mounts.insert(
        "/source:rw".to_string(),
        MountSpec::BindMount {
            source: inputs.source_dir.clone(),
            writable: true,
        },
    );
    mounts.insert(
        "/install:rw".to_string(),
        MountSpec::BindMount {
            source: inputs.install_dir.clone(),
            writable: true,
        },
    );

    let mut env = BTreeMap::new();
    env.insert("nproc".to_string(), inputs.nproc.to_string());
    env.insert("NPROC".to_string(), inputs.nproc.to_string());

    let invocation = SandboxInvocation {
        command: vec!["/bin/sh".to_string(), "-c".to_string(), BUILD_SCRIPT.to_string()],
        rootfs: rootfs.to_path_buf(),
        mounts,
        env,
        uid: 1000,
        gid: 1000,
        cwd: "/source".to_string(),
        name: format!("build-{}", &inputs.commit[..12.min(inputs.commit.len())]),
    };

    let handle = match sandbox_runtime::build(&ctx.runtime_bin, &ctx.sandbox_state_root, &invocation) {
        Ok(handle) => handle,
        Err(_) => {
            return Err(BuildFailure {
                reason: FailureReason::BuildFailed,
                exit_code: -1,
                term_signal: 0,
                log: "failed to prepare sandbox bundle".to_string(),
            })
        }
    };

    run_with_timeout(&handle.argv, inputs.timeout_s)
}

/// Run `argv`, enforcing `timeout_s`: on expiry send SIGTERM to the whole
/// process tree, then SIGKILL after a 10s grace period if it's still
/// alive. The container runtime does not reliably forward signals to its
/// descendants, so [`procutil::recursive_kill`] walks `/proc` itself.
///
/// Output is captured through `duct`'s background-thread draining
/// (`.stdout_capture()` on a `.start()`'d handle) rather than a raw
/// `std::process::Command` pipe, which would deadlock: a build writes far
/// more than a pipe buffer holds, and nothing reads it until the process
/// has already exited.
fn run_with_timeout(argv: &[String], timeout_s: u64) -> std::result::Result<(), BuildFailure> {
    let handle = match cmd(&argv[0], &argv[1..])
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .start()
    {
        Ok(handle) => handle,
        Err(e) => {
            return Err(BuildFailure {
                reason: FailureReason::BuildFailed,
                exit_code: -1,
                term_signal: 0,
                log: format!("failed to start container runtime: {e}"),
            })
        }
    };

    let deadline = Instant::now() + Duration::from_secs(timeout_s);
    let mut timed_out = false;

    loop {
        match handle.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(e) => {
                return Err(BuildFailure {
                    reason: FailureReason::BuildFailed,
                    exit_code: -1,
                    term_signal: 0,
                    log: format!("container runtime failed: {e}"),
                })
            }
        }
        if Instant::now() >= deadline {
            timed_out = true;
            for pid in handle.pids() {
                let _ = procutil::recursive_kill(pid as i32, nix::sys::signal::Signal::SIGTERM);
            }
            let grace = Instant::now() + Duration::from_secs(10);
            loop {
                if matches!(handle.try_wait(), Ok(Some(_))) {
                    break;
                }
                if Instant::now() >= grace {
                    for pid in handle.pids() {
                        let _ = procutil::recursive_kill(pid as i32, nix::sys::signal::Signal::SIGKILL);
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            }
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    let output = match handle.wait() {
        Ok(output) => output,
        Err(e) => {
            return Err(BuildFailure {
                reason: FailureReason::BuildFailed,
                exit_code: -1,
                term_signal: 0,
                log: format!("failed to collect build output: {e}"),
            })
        }
    };

    let log = tail_lines(&String::from_utf8_lossy(&output.stdout), 100);

    if timed_out {
        return Err(BuildFailure {
            reason: FailureReason::Timeout,
            exit_code: output.status.code().unwrap_or(-1),
            term_signal: term_signal(&output.status),
            log,
        });
    }

    if !output.status.success() {
        return Err(BuildFailure {
            reason: FailureReason::BuildFailed,
            exit_code: output.status.code().unwrap_or(-1),
            term_signal: term_signal(&output.status),
            log,
        });
    }

    Ok(())
}

#[cfg(unix)]
fn term_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Run the installed interpreter with `-e 42` and require a clean exit;
/// this is the entire post-build sanity check.
fn smoke_test(inputs: &BuildInputs) -> std::result::Result<(), BuildFailure> {
    let julia = inputs.install_dir.join("bin/julia");
    if !julia.exists() {
        return Err(BuildFailure {
            reason: FailureReason::SmokeTestFailed,
            exit_code: -1,
            term_signal: 0,
            log: format!("{} does not exist; install tree:\n{}", julia.display(), list_install(inputs)),
        });
    }

    let output = cmd(&julia, ["-e", "42"])
        .stderr_to_stdout()
        .stdout_capture()
        .unchecked()
        .run();

    match output {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(BuildFailure {
            reason: FailureReason::SmokeTestFailed,
            exit_code: output.status.code().unwrap_or(-1),
            term_signal: term_signal(&output.status),
            log: tail_lines(&String::from_utf8_lossy(&output.stdout), 50)
                + "\n"
                + &list_install(inputs),
        }),
        Err(e) => Err(BuildFailure {
            reason: FailureReason::SmokeTestFailed,
            exit_code: -1,
            term_signal: 0,
            log: format!("failed to run smoke test: {e}\n{}", list_install(inputs)),
        }),
    }
}

fn list_install(inputs: &BuildInputs) -> String {
    walkdir::WalkDir::new(&inputs.install_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().display().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove `share/doc` and `share/man`: they bloat the pack without
/// affecting anything the smoke test or a user of the extracted tree
/// needs.
fn trim(install_dir: &Path) -> Result<()> {
    for sub in ["share/doc", "share/man"] {
        let path = install_dir.join(sub);
        if path.exists() {
            fs::remove_dir_all(&path).context(error::CreateDirSnafu { path })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_target_is_known_for_every_supported_arch() {
        for arch in ["x86_64", "i686", "armv7l", "aarch64", "powerpc64le"] {
            assert!(cpu_target(arch).is_ok(), "missing CPU target for {arch}");
        }
        assert!(cpu_target("sparc64").is_err());
    }

    #[test]
    fn write_make_user_includes_assertions_flags_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = BuildInputs {
            source_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        write_make_user("x86_64", &inputs).unwrap();
        let contents = fs::read_to_string(dir.path().join("Make.user")).unwrap();
        assert!(!contents.contains("FORCE_ASSERTIONS"));

        inputs.asserts = true;
        write_make_user("x86_64", &inputs).unwrap();
        let contents = fs::read_to_string(dir.path().join("Make.user")).unwrap();
        assert!(contents.contains("FORCE_ASSERTIONS=1"));
        assert!(contents.contains("LLVM_ASSERTIONS=1"));
    }

    #[test]
    fn tail_lines_keeps_only_the_last_n() {
        let text: String = (0..200).map(|i| format!("line{i}\n")).collect();
        let tail = tail_lines(&text, 100);
        assert_eq!(tail.lines().count(), 100);
        assert_eq!(tail.lines().next().unwrap(), "line100");
    }

    #[test]
    fn trim_removes_docs_and_man_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("share/doc")).unwrap();
        fs::create_dir_all(dir.path().join("share/man")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::write(dir.path().join("bin/julia"), b"binary").unwrap();

        trim(dir.path()).unwrap();

        assert!(!dir.path().join("share/doc").exists());
        assert!(!dir.path().join("share/man").exists());
        assert!(dir.path().join("bin/julia").exists());
    }
}
