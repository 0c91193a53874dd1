//! Live filesystem directory adapter.
//!
//! Enumeration is grounded on chunkah's `scan.rs` `Scanner` (symlink
//! classification, `skip_special_files`-style error on sockets/FIFOs/device
//! files), generalized to also resolve owner/group names and to serve as a
//! read/write adapter rather than a read-only OCI-layer scan source.

use std::os::unix::fs::MetadataExt;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::adapter::Adapter;
use crate::error::DirPatchError;
use crate::metadata::{apply_ownership, apply_permissions, recreate_symlink};
use crate::tree::{DirEntry, Entry, FileEntry, Metadata, SymlinkEntry, Tree};
use crate::users;

pub struct FilesystemAdapter {
    root: Utf8PathBuf,
    tree: OnceLock<Tree>,
}

impl FilesystemAdapter {
    pub fn can_open(path: &Utf8Path) -> bool {
        path.is_dir()
    }

    pub fn open(path: &Utf8Path) -> Result<Self> {
        anyhow::ensure!(path.is_dir(), "not a directory: {path}");
        Ok(Self {
            root: path.to_owned(),
            tree: OnceLock::new(),
        })
    }

    /// Write-mode constructor: `path` must not yet exist.
    pub fn create(path: &Utf8Path) -> Result<Self> {
        if path.exists() {
            return Err(DirPatchError::AlreadyExists(path.to_owned()).into());
        }
        Ok(Self {
            root: path.to_owned(),
            tree: OnceLock::new(),
        })
    }

    fn build_tree(&self) -> Result<Tree> {
        let root_name = self
            .root
            .file_name()
            .unwrap_or(self.root.as_str())
            .to_string();
        let mut tree = Tree::new(root_name);
        tracing::debug!(root = %self.root, "FS: gathering filelist");
        walk(&self.root, Utf8Path::new(""), &mut tree)
            .with_context(|| format!("walking {}", self.root))?;
        tracing::debug!(root = %self.root, "FS: gathering completed");
        Ok(tree)
    }
}

fn walk(abs_dir: &Utf8Path, rel_dir: &Utf8Path, tree: &mut Tree) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(abs_dir)
        .with_context(|| format!("reading directory {abs_dir}"))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let abs_path = Utf8PathBuf::try_from(entry.path())
            .with_context(|| format!("non-UTF8 path under {abs_dir}"))?;
        let rel_path = if rel_dir.as_str().is_empty() {
            Utf8PathBuf::from(&name)
        } else {
            rel_dir.join(&name)
        };

        let meta = std::fs::symlink_metadata(&abs_path)
            .with_context(|| format!("stat {abs_path}"))?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let target = std::fs::read_link(&abs_path)
                .with_context(|| format!("reading symlink {abs_path}"))?;
            let target = target
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("non-UTF8 symlink target at {abs_path}"))?
                .to_string();
            tree.insert(
                rel_path,
                Entry::Symlink(SymlinkEntry {
                    name,
                    metadata: metadata_from(&meta),
                    link_target: target,
                }),
            );
        } else if file_type.is_dir() {
            tree.insert(
                rel_path.clone(),
                Entry::Directory(DirEntry {
                    name,
                    metadata: metadata_from(&meta),
                }),
            );
            walk(&abs_path, &rel_path, tree)?;
        } else if file_type.is_file() {
            tree.insert(
                rel_path,
                Entry::File(FileEntry {
                    name,
                    metadata: metadata_from(&meta),
                }),
            );
        } else {
            anyhow::bail!("special file type not supported: {abs_path}");
        }
    }
    Ok(())
}

fn metadata_from(meta: &std::fs::Metadata) -> Metadata {
    let uid = meta.uid();
    let gid = meta.gid();
    Metadata {
        permissions: Some(meta.mode() & 0o7777),
        uid: Some(uid),
        gid: Some(gid),
        owner_name: users::user_name(uid),
        group_name: users::group_name(gid),
    }
}

impl Adapter for FilesystemAdapter {
    fn tree(&self) -> Result<&Tree> {
        if let Some(t) = self.tree.get() {
            return Ok(t);
        }
        let built = self.build_tree()?;
        Ok(self.tree.get_or_init(|| built))
    }

    fn expand(&self, relative_path: Option<&Utf8Path>, extraction_root: &Utf8Path) -> Result<()> {
        let tree = self.tree()?;

        match relative_path {
            None => {
                std::fs::create_dir_all(extraction_root)
                    .with_context(|| format!("creating {extraction_root}"))?;
                let mut paths: Vec<_> = tree.paths().collect();
                paths.sort();
                for path in paths {
                    self.expand(Some(path.as_path()), extraction_root)?;
                }
                Ok(())
            }
            Some(rel) => {
                let entry = tree.get(rel).ok_or_else(|| {
                    DirPatchError::MissingEntry(self.root.join(rel))
                })?;
                let source = self.root.join(rel);
                let target = extraction_root.join(rel);

                match entry {
                    Entry::Symlink(s) => recreate_symlink(&target, &s.link_target),
                    Entry::Directory(d) => {
                        std::fs::create_dir_all(&target)
                            .with_context(|| format!("creating directory {target}"))?;
                        let _ = apply_permissions(&target, &d.metadata);
                        let _ = apply_ownership(&target, &d.metadata, true);
                        Ok(())
                    }
                    Entry::File(f) => {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)
                                .with_context(|| format!("creating directory {parent}"))?;
                        }
                        copy_preserving_mode_and_times(&source, &target)?;
                        apply_permissions(&target, &f.metadata)?;
                        Ok(())
                    }
                }
            }
        }
    }

    fn create_from(&self, base_dir: &Utf8Path) -> Result<()> {
        if self.root.exists() {
            return Err(DirPatchError::AlreadyExists(self.root.clone()).into());
        }
        copy_tree_preserving_symlinks(base_dir, &self.root)
    }
}

fn copy_preserving_mode_and_times(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::fs::copy(src, dst).with_context(|| format!("copying {src} to {dst}"))?;
    let meta = std::fs::metadata(src).with_context(|| format!("stat {src}"))?;
    if let (Ok(modified), Ok(accessed)) = (meta.modified(), meta.accessed()) {
        let times = std::fs::FileTimes::new()
            .set_modified(modified)
            .set_accessed(accessed);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dst)
            .with_context(|| format!("opening {dst} to set times"))?;
        // Best-effort: some filesystems reject arbitrary timestamps.
        let _ = file.set_times(times);
    }
    Ok(())
}

fn copy_tree_preserving_symlinks(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
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
            copy_tree_preserving_symlinks(&child_src, &child_dst)?;
        } else {
            copy_preserving_mode_and_times(&child_src, &child_dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerates_nested_files_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/file"), b"hi").unwrap();
        std::os::unix::fs::symlink("b/file", root.join("a/link")).unwrap();

        let adapter = FilesystemAdapter::open(root).unwrap();
        let tree = adapter.tree().unwrap();

        assert!(tree.contains(Utf8Path::new("a")));
        assert!(tree.contains(Utf8Path::new("a/b")));
        assert!(tree.contains(Utf8Path::new("a/b/file")));
        assert!(tree.get(Utf8Path::new("a/link")).unwrap().is_symlink());
        assert_eq!(
            tree.get(Utf8Path::new("a/link")).unwrap().link_target(),
            Some("b/file")
        );
    }

    #[test]
    fn expand_recreates_symlink_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        std::os::unix::fs::symlink("nonexistent-target", root.join("link")).unwrap();

        let adapter = FilesystemAdapter::open(root).unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_root = Utf8Path::from_path(out.path()).unwrap();

        adapter
            .expand(Some(Utf8Path::new("link")), out_root)
            .unwrap();

        let target = std::fs::read_link(out_root.join("link")).unwrap();
        assert_eq!(target.to_str().unwrap(), "nonexistent-target");
    }

    #[test]
    fn expand_missing_entry_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let adapter = FilesystemAdapter::open(root).unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_root = Utf8Path::from_path(out.path()).unwrap();

        let err = adapter
            .expand(Some(Utf8Path::new("nope")), out_root)
            .unwrap_err();
        assert!(err.downcast_ref::<DirPatchError>().is_some());
    }
}
