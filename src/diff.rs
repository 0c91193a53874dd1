//! Diff engine: produces a patch bundle from an old and a new snapshot.
//!
//! Grounded on the original's `XDelta3DirPatcher.diff`/`_find_file_delta`:
//! for each entry in the new tree, expand just that entry from each
//! snapshot into scratch directories, invoke XDelta3 (or mirror the
//! symlink, or just `mkdir`) into the nascent `xdelta/` tree, copy
//! attributes across, then delete the per-entry staged copies immediately
//! to cap peak staging footprint. Removed files are never recorded here;
//! apply infers them by diffing the target tree against the bundle's own
//! mirrored tree.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::adapter::{self, Adapter};
use crate::bundle;
use crate::metadata::{copy_attributes, recreate_symlink};
use crate::runner::TaskRunner;
use crate::tree::Entry;
use crate::xdelta;

pub struct DiffOptions {
    pub staging_dir: Utf8PathBuf,
    pub workers: Option<usize>,
    /// Raw bytes copied verbatim into the bundle's `.info` member.
    pub metadata_file: Option<Utf8PathBuf>,
}

pub fn diff(
    old_path: &Utf8Path,
    new_path: &Utf8Path,
    bundle_path: &Utf8Path,
    options: &DiffOptions,
) -> Result<()> {
    bundle::ensure_absent(bundle_path)?;

    let old: Arc<dyn Adapter> =
        Arc::from(adapter::open(old_path).with_context(|| format!("opening {old_path}"))?);
    let new: Arc<dyn Adapter> =
        Arc::from(adapter::open(new_path).with_context(|| format!("opening {new_path}"))?);

    let new_tree = new.tree()?.clone();
    let old_tree = old.tree()?.clone();
    tracing::debug!(tree = %new_tree, "diff: new snapshot tree");
    tracing::info!(old = %old_path, new = %new_path, entries = new_tree.len(), "diff: starting");

    let target_root = options.staging_dir.join("target");
    let old_src = options.staging_dir.join("old_src");
    let new_src = options.staging_dir.join("new_src");
    let xdelta_root = target_root.join(bundle::XDELTA_DIR);
    std::fs::create_dir_all(&xdelta_root)?;
    std::fs::create_dir_all(&old_src)?;
    std::fs::create_dir_all(&new_src)?;

    let runner = match options.workers {
        Some(n) => TaskRunner::with_workers(n)?,
        None => TaskRunner::new()?,
    };

    let mut tasks: Vec<Box<dyn FnOnce() -> Result<()> + Send>> = Vec::new();
    for (path, entry) in new_tree.iter() {
        let path = path.clone();
        let entry = entry.clone();
        let has_old = old_tree.contains(&path);
        let old = old.clone();
        let new = new.clone();
        let old_src = old_src.clone();
        let new_src = new_src.clone();
        let xdelta_root = xdelta_root.clone();
        tasks.push(Box::new(move || {
            diff_one(
                &path, &entry, has_old, &old, &new, &old_src, &new_src, &xdelta_root,
            )
        }));
    }
    runner.run_all(tasks)?;

    let _ = std::fs::remove_dir_all(&old_src);
    let _ = std::fs::remove_dir_all(&new_src);

    let metadata_bytes = match &options.metadata_file {
        Some(path) => Some(std::fs::read(path).with_context(|| format!("reading {path}"))?),
        None => None,
    };
    bundle::package(&xdelta_root, metadata_bytes.as_deref(), bundle_path)
        .with_context(|| format!("packaging {bundle_path}"))?;

    let _ = std::fs::remove_dir_all(&target_root);

    tracing::info!(bundle = %bundle_path, "diff: completed");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn diff_one(
    path: &Utf8Path,
    entry: &Entry,
    has_old: bool,
    old: &Arc<dyn Adapter>,
    new: &Arc<dyn Adapter>,
    old_src: &Utf8Path,
    new_src: &Utf8Path,
    xdelta_root: &Utf8Path,
) -> Result<()> {
    new.expand(Some(path), new_src)
        .with_context(|| format!("expanding new entry {path}"))?;
    if has_old {
        old.expand(Some(path), old_src)
            .with_context(|| format!("expanding old entry {path}"))?;
    }

    let new_file = new_src.join(path);
    let old_file = old_src.join(path);
    let target = xdelta_root.join(path);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating directory {parent}"))?;
    }

    match entry {
        Entry::Symlink(_) => {
            let link_target = std::fs::read_link(&new_file)
                .with_context(|| format!("reading symlink {new_file}"))?;
            let link_target = link_target
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("non-UTF8 symlink target at {new_file}"))?;
            recreate_symlink(&target, link_target)?;
        }
        Entry::Directory(_) => {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("creating directory {target}"))?;
            copy_attributes(&new_file, &target, true)?;
        }
        Entry::File(_) => {
            let old_source = (has_old && old_file.is_file()).then_some(old_file.as_path());
            xdelta::encode(old_source, &new_file, &target)
                .with_context(|| format!("encoding delta for {path}"))?;
            copy_attributes(&new_file, &target, true)?;
        }
    }

    // Cap peak staging footprint: this entry's staged copies are no longer
    // needed once its delta has been written.
    remove_staged(&new_file);
    if has_old {
        remove_staged(&old_file);
    }
    Ok(())
}

fn remove_staged(path: &Utf8Path) {
    if path.is_dir() {
        let _ = std::fs::remove_dir(path);
    } else {
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_overwrite_existing_bundle() {
        let staging = tempfile::tempdir().unwrap();
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let bundle_dir = tempfile::tempdir().unwrap();
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().join("bundle.tar.gz")).unwrap();
        std::fs::write(&bundle_path, b"already here").unwrap();

        let options = DiffOptions {
            staging_dir: Utf8PathBuf::try_from(staging.path().to_path_buf()).unwrap(),
            workers: Some(1),
            metadata_file: None,
        };

        let err = diff(
            Utf8Path::from_path(old.path()).unwrap(),
            Utf8Path::from_path(new.path()).unwrap(),
            &bundle_path,
            &options,
        )
        .unwrap_err();
        assert!(err.downcast_ref::<crate::error::DirPatchError>().is_some());
    }
}
