//! Command-line surface.
//!
//! Grounded on chunkah's `cmd_build.rs` (`clap::Parser` derive struct per
//! subcommand, `camino::Utf8PathBuf` fields) and the original's `argparse`
//! setup: `diff [--metadata PATH] OLD NEW BUNDLE [-s STAGING_DIR]`, `apply
//! OLD BUNDLE [TARGET] [-d SUBPATH] [--ignore-euid] [-s STAGING_DIR]`, plus
//! `--debug`/`--verbose`/`--version`.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "xdirpatch", version, about = "Directory-level binary patches via XDelta3")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug-level logging, including per-entry tree dumps.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Enable info-level progress logging.
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compute a patch bundle between an old and a new snapshot.
    Diff(DiffArgs),
    /// Apply a patch bundle to a directory, transforming it in place.
    Apply(ApplyArgs),
}

#[derive(Debug, Parser)]
pub struct DiffArgs {
    /// Old snapshot: a directory, a `.tar.gz`, or a `.zip`.
    pub old: Utf8PathBuf,

    /// New snapshot: a directory, a `.tar.gz`, or a `.zip`.
    pub new: Utf8PathBuf,

    /// Output bundle path (must not already exist).
    pub bundle: Utf8PathBuf,

    /// Arbitrary bytes copied verbatim into the bundle's `.info` member.
    #[arg(long)]
    pub metadata: Option<Utf8PathBuf>,

    /// Scratch directory for intermediate expansion; defaults to a fresh
    /// temporary directory when omitted.
    #[arg(short, long)]
    pub staging_dir: Option<Utf8PathBuf>,

    /// Number of worker threads; defaults to `available_parallelism - 1`.
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Parser)]
pub struct ApplyArgs {
    /// Snapshot the bundle was diffed against.
    pub old: Utf8PathBuf,

    /// Bundle produced by `diff`.
    pub bundle: Utf8PathBuf,

    /// Directory to reconstruct the new snapshot into. Defaults to `old`
    /// (in-place apply) when omitted.
    pub target: Option<Utf8PathBuf>,

    /// Restrict application to a sub-path inside the bundle's `xdelta/`
    /// tree.
    #[arg(short = 'd', long = "root-patch-dir")]
    pub sub_path: Option<Utf8PathBuf>,

    /// Scratch directory for intermediate expansion; defaults to a fresh
    /// temporary directory when omitted.
    #[arg(short, long)]
    pub staging_dir: Option<Utf8PathBuf>,

    /// Number of worker threads; defaults to `available_parallelism - 1`.
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// Skip the effective-uid precondition and tolerate ownership-restore
    /// failures instead of treating them as fatal.
    #[arg(long)]
    pub ignore_euid: bool,
}
