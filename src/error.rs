//! Error taxonomy for the engine.
//!
//! Call sites generally propagate these through `anyhow::Error` with
//! `.context(...)` chains, the same way chunkah layers context onto
//! `anyhow::Result` everywhere. The variants here exist so the CLI can match
//! on the *kind* of failure (e.g. to map `InsufficientPrivilege` to a
//! specific exit code) without parsing error strings.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DirPatchError {
    #[error("unsupported archive: {0}")]
    UnsupportedArchive(Utf8PathBuf),

    #[error("archive already exists: {0}")]
    AlreadyExists(Utf8PathBuf),

    #[error("no such entry in archive: {0}")]
    MissingEntry(Utf8PathBuf),

    #[error("xdelta3 failed with status {status}: {output}")]
    CodecFailure { status: i32, output: String },

    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
