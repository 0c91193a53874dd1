//! Patch bundle packaging and layout.
//!
//! A bundle is a `tar.gz` whose root holds an `xdelta/` directory mirroring
//! the new snapshot's relative paths (directories and symlinks copied
//! verbatim, regular files replaced by their xdelta3 delta against the old
//! snapshot) plus an optional `.info` file: arbitrary bytes copied verbatim
//! from a user-supplied metadata file, never interpreted by apply. The old
//! snapshot itself is never stored in the bundle; the apply side supplies it.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::adapter::tar::TarAdapter;
use crate::adapter::Adapter;
use crate::error::DirPatchError;
use crate::tree::Tree;

pub const XDELTA_DIR: &str = "xdelta";
pub const INFO_FILE: &str = ".info";

/// Assemble `xdelta_root` (and, if present, raw `.info` bytes) into a
/// bundle at `bundle_path`. `xdelta_root` must already contain the
/// fully-populated mirrored tree; this only handles final packaging.
pub fn package(xdelta_root: &Utf8Path, info: Option<&[u8]>, bundle_path: &Utf8Path) -> Result<()> {
    let staging = tempfile::tempdir().context("creating bundle staging directory")?;
    let staging_root = Utf8Path::from_path(staging.path())
        .ok_or_else(|| anyhow::anyhow!("non-UTF8 temporary directory path"))?;

    let xdelta_dest = staging_root.join(XDELTA_DIR);
    copy_dir(xdelta_root, &xdelta_dest)?;

    if let Some(info) = info {
        std::fs::write(staging_root.join(INFO_FILE), info).context("writing bundle .info file")?;
    }

    let adapter = TarAdapter::create(bundle_path)?;
    adapter.create_from(staging_root)
}

/// Open an existing bundle for reading.
pub fn open(bundle_path: &Utf8Path) -> Result<TarAdapter> {
    TarAdapter::open(bundle_path)
}

/// Given the bundle's own tree and a patch root (`xdelta`, or
/// `xdelta/<sub-path>` when the apply caller restricts to a subtree),
/// return `(relative_path, entry)` pairs for every patch member, with the
/// patch root prefix stripped so paths line up with the snapshot trees
/// being applied.
pub fn mirrored_entries<'a>(
    bundle_tree: &'a Tree,
    patch_root: &Utf8Path,
) -> Vec<(Utf8PathBuf, &'a crate::tree::Entry)> {
    bundle_tree
        .iter()
        .filter_map(|(path, entry)| {
            path.strip_prefix(patch_root)
                .ok()
                .filter(|rel| !rel.as_str().is_empty())
                .map(|rel| (rel.to_owned(), entry))
        })
        .collect()
}

fn copy_dir(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("creating {dst}"))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("reading {src}"))? {
        let entry = entry?;
        let name = entry.file_name();
        let child_src = Utf8PathBuf::try_from(entry.path())?;
        let child_dst = dst.join(name.to_string_lossy().as_ref());
        let meta = std::fs::symlink_metadata(&child_src)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&child_src)?;
            std::os::unix::fs::symlink(&target, &child_dst)
                .with_context(|| format!("symlinking {child_dst}"))?;
        } else if meta.is_dir() {
            copy_dir(&child_src, &child_dst)?;
        } else {
            std::fs::copy(&child_src, &child_dst)
                .with_context(|| format!("copying {child_src} to {child_dst}"))?;
        }
    }
    Ok(())
}

/// Guard against packaging into a path that already exists, surfacing the
/// same typed error every adapter's write mode uses.
pub fn ensure_absent(path: &Utf8Path) -> Result<()> {
    if path.exists() {
        return Err(DirPatchError::AlreadyExists(path.to_owned()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Adapter;

    #[test]
    fn mirrored_entries_strips_patch_root_and_skips_container() {
        let mut tree = Tree::new("bundle");
        tree.insert(
            Utf8PathBuf::from(XDELTA_DIR),
            crate::tree::Entry::Directory(crate::tree::DirEntry {
                name: XDELTA_DIR.into(),
                metadata: Default::default(),
            }),
        );
        tree.insert(
            Utf8PathBuf::from(format!("{XDELTA_DIR}/a/file")),
            crate::tree::Entry::File(crate::tree::FileEntry {
                name: "file".into(),
                metadata: Default::default(),
            }),
        );

        let mirrored = mirrored_entries(&tree, Utf8Path::new(XDELTA_DIR));
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].0, Utf8PathBuf::from("a/file"));
    }

    #[test]
    fn mirrored_entries_honors_sub_path_restriction() {
        let mut tree = Tree::new("bundle");
        tree.insert(
            Utf8PathBuf::from(format!("{XDELTA_DIR}/a/file")),
            crate::tree::Entry::File(crate::tree::FileEntry {
                name: "file".into(),
                metadata: Default::default(),
            }),
        );
        tree.insert(
            Utf8PathBuf::from(format!("{XDELTA_DIR}/b/file")),
            crate::tree::Entry::File(crate::tree::FileEntry {
                name: "file".into(),
                metadata: Default::default(),
            }),
        );

        let restricted = mirrored_entries(&tree, &Utf8PathBuf::from(format!("{XDELTA_DIR}/a")));
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].0, Utf8PathBuf::from("file"));
    }

    #[test]
    fn package_then_open_round_trips() {
        let xdelta_root = tempfile::tempdir().unwrap();
        let xdelta_path = Utf8Path::from_path(xdelta_root.path()).unwrap();
        std::fs::create_dir_all(xdelta_path.join("a")).unwrap();
        std::fs::write(xdelta_path.join("a/file.delta"), b"delta-bytes").unwrap();

        let bundle_dir = tempfile::tempdir().unwrap();
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().join("bundle.tar.gz")).unwrap();

        package(xdelta_path, Some(b"raw metadata"), &bundle_path).unwrap();

        let adapter = open(&bundle_path).unwrap();
        let tree = adapter.tree().unwrap();
        assert!(tree.contains(Utf8Path::new(XDELTA_DIR)));
        assert!(tree.contains(Utf8Path::new("xdelta/a/file.delta")));
        assert!(tree.contains(Utf8Path::new(INFO_FILE)));
    }
}
