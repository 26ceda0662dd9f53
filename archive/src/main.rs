use crate::cmd::{init_logger, Args, Subcommand};
use anyhow::Result;
use clap::Parser;

mod cmd;
mod context;
mod versions;

/// `anyhow` prints a nicely formatted error message with `Debug`, so we can
/// return a result from `main`.
fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);

    let bootstrap = context::Bootstrap::load()?;

    let exit_code = match args.subcommand {
        Subcommand::Build(build_args) => cmd::build::run(&bootstrap, build_args)?,
        Subcommand::Run(run_args) => cmd::run::run(&bootstrap, run_args)?,
        Subcommand::Extract(extract_args) => cmd::extract::run(&bootstrap, extract_args)?,
        Subcommand::Verify(verify_args) => cmd::verify::run(&bootstrap, verify_args)?,
        Subcommand::Status(status_args) => cmd::status::run(&bootstrap, status_args)?,
    };

    std::process::exit(exit_code);
}
