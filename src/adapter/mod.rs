//! Archive adapter contract and the fixed-order filesystem -> tar -> zip
//! probe that picks a concrete implementation for a given path.
//!
//! Grounded on chunkah's `tar.rs`/`scan.rs` for the concrete read/write
//! idioms, generalized from chunkah's single "build a content-addressed OCI
//! layer from a rootfs" use case to the three-way filesystem/tar/zip
//! abstraction the design notes call for (replacing the original's
//! `__subclasses__` runtime discovery with adapters registered explicitly,
//! in a fixed probe order).

pub mod filesystem;
pub mod tar;
pub mod zip;

use anyhow::Result;
use camino::Utf8Path;

use crate::error::DirPatchError;
use crate::tree::Tree;

/// A provider that presents some backing store (filesystem directory,
/// tar.gz, or zip) as an enumerable snapshot tree.
///
/// `expand`/`create_from` take `Option<&Utf8Path>` for the relative path
/// where `None` denotes the snapshot root, matching the "distinguished
/// absent/empty value" the data model specifies for the root key.
pub trait Adapter: Send + Sync {
    /// Enumerate (if not already cached) and return the snapshot tree.
    fn tree(&self) -> Result<&Tree>;

    /// Materialize the entry at `relative_path` under `extraction_root`.
    fn expand(&self, relative_path: Option<&Utf8Path>, extraction_root: &Utf8Path) -> Result<()>;

    /// Ingest `base_dir` into this (empty, write-mode) backing store.
    fn create_from(&self, base_dir: &Utf8Path) -> Result<()>;
}

/// Open `path` with whichever adapter claims it first, probing in the fixed
/// order filesystem → tar → zip.
pub fn open(path: &Utf8Path) -> Result<Box<dyn Adapter>> {
    if filesystem::FilesystemAdapter::can_open(path) {
        return Ok(Box::new(filesystem::FilesystemAdapter::open(path)?));
    }
    if tar::TarAdapter::can_open(path) {
        return Ok(Box::new(tar::TarAdapter::open(path)?));
    }
    if zip::ZipAdapter::can_open(path) {
        return Ok(Box::new(zip::ZipAdapter::open(path)?));
    }
    Err(DirPatchError::UnsupportedArchive(path.to_owned()).into())
}
