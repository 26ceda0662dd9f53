use crate::cmd::is_stored;
use crate::context::{self, Bootstrap};
use anyhow::{Context, Result};
use clap::Args;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Revision to run: a full or abbreviated commit hash, branch tip, or
    /// tag.
    pub rev: String,

    /// Look in the `-asserts` database instead of the plain one.
    #[clap(long)]
    pub asserts: bool,

    /// Arguments passed through to the interpreter.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// 0 on a clean exit, 125 if `rev` isn't stored, the child's exit code
/// otherwise. On abnormal child termination this re-raises the same signal
/// against the current process and never returns.
pub fn run(bootstrap: &Bootstrap, args: RunArgs) -> Result<i32> {
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

    let install_dir = tempfile::tempdir().context("creating scratch directory")?;
    db.extract(&rev, install_dir.path()).context("extracting revision")?;

    let julia = install_dir.path().join("bin/julia");
    let status = std::process::Command::new(&julia)
        .args(&args.args)
        .status()
        .with_context(|| format!("running {}", julia.display()))?;

    if let Some(code) = status.code() {
        return Ok(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            reraise(sig);
        }
    }

    Ok(1)
}

/// Reset `sig`'s disposition to default and raise it against this process,
/// so a caller waiting on us (e.g. a bisect harness) observes the same
/// signal the child died from rather than an opaque nonzero exit.
#[cfg(unix)]
fn reraise(sig: i32) -> ! {
    use nix::sys::signal::{self, SigHandler, Signal};
    let signal = Signal::try_from(sig).unwrap_or(Signal::SIGKILL);
    unsafe {
        let _ = signal::signal(signal, SigHandler::SigDfl);
    }
    let _ = signal::raise(signal);
    std::process::exit(128 + sig);
}
