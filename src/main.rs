use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use xdirpatch::apply::{self, ApplyOptions};
use xdirpatch::cli::{Cli, Command};
use xdirpatch::diff::{self, DiffOptions};
use xdirpatch::error::DirPatchError;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            exit_code_for(&err)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Diff(args) => {
            let staging_dir = staging_dir(args.staging_dir.clone())?;
            let options = DiffOptions {
                staging_dir: staging_dir.path().to_owned(),
                workers: args.workers,
                metadata_file: args.metadata.clone(),
            };
            diff::diff(&args.old, &args.new, &args.bundle, &options)
        }
        Command::Apply(args) => {
            let staging_dir = staging_dir(args.staging_dir.clone())?;
            let target = args.target.clone().unwrap_or_else(|| args.old.clone());
            let options = ApplyOptions {
                staging_dir: staging_dir.path().to_owned(),
                workers: args.workers,
                sub_path: args.sub_path.clone(),
                ignore_euid: args.ignore_euid,
            };
            apply::apply(&args.old, &args.bundle, &target, &options)
        }
    }
}

/// `InsufficientPrivilege` gets its own exit code so wrapper scripts can
/// tell "needs root" apart from other fatal errors without parsing text.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<DirPatchError>() {
        Some(DirPatchError::InsufficientPrivilege(_)) => ExitCode::from(77),
        _ => ExitCode::FAILURE,
    }
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A staging directory the caller owns, either a temp dir we clean up on
/// drop or a persistent one the user picked with `-s/--staging-dir`.
enum Staging {
    Temp(tempfile::TempDir),
    Persistent(Utf8PathBuf),
}

impl Staging {
    fn path(&self) -> Utf8PathBuf {
        match self {
            Staging::Temp(dir) => Utf8PathBuf::try_from(dir.path().to_path_buf())
                .expect("temp dir path is always UTF-8 in practice"),
            Staging::Persistent(path) => path.clone(),
        }
    }
}

fn staging_dir(explicit: Option<Utf8PathBuf>) -> Result<Staging> {
    match explicit {
        Some(path) => {
            std::fs::create_dir_all(&path)?;
            Ok(Staging::Persistent(path))
        }
        None => Ok(Staging::Temp(tempfile::tempdir()?)),
    }
}
