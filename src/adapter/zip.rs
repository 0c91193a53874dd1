//! Zip adapter.
//!
//! Grounded on the `zip` crate's read API (see the retrieved
//! `zip2::read` sample for the handle-creation pattern) generalized to a
//! read/write snapshot adapter. Zip has no native uid/gid field, so
//! entries here never carry ownership, which is the reason ownership
//! restoration is governed per-adapter rather than assumed globally.
//!
//! Like the tar adapter, `zip::ZipArchive` needs `&mut self` per member
//! read, which is awkward from the `&self` trait surface the bounded task
//! pool shares across threads; we decode every member once up front under
//! the archive's own borrow and cache contents behind a `Mutex`, the same
//! shared-handle-serialization role the original's `threading.RLock` played.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::DirPatchError;
use crate::metadata::{apply_permissions, recreate_symlink};
use crate::tree::{DirEntry, Entry, FileEntry, Metadata, SymlinkEntry, Tree};

use super::Adapter;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;

#[derive(Debug)]
struct ZipState {
    tree: Tree,
    contents: Mutex<HashMap<Utf8PathBuf, Vec<u8>>>,
}

#[derive(Debug)]
pub struct ZipAdapter {
    path: Utf8PathBuf,
    state: OnceLock<ZipState>,
}

impl ZipAdapter {
    pub fn can_open(path: &Utf8Path) -> bool {
        if !path.is_file() {
            return false;
        }
        if path.as_str().ends_with(".zip") {
            return true;
        }
        has_zip_magic(path)
    }

    pub fn open(path: &Utf8Path) -> Result<Self> {
        Ok(Self {
            path: path.to_owned(),
            state: OnceLock::new(),
        })
    }

    pub fn create(path: &Utf8Path) -> Result<Self> {
        if path.exists() {
            return Err(DirPatchError::AlreadyExists(path.to_owned()).into());
        }
        Ok(Self {
            path: path.to_owned(),
            state: OnceLock::new(),
        })
    }

    fn build_state(&self) -> Result<ZipState> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening {}", self.path))?;
        let mut archive = ::zip::ZipArchive::new(file).context("reading zip central directory")?;

        let root_name = self
            .path
            .file_name()
            .unwrap_or(self.path.as_str())
            .to_string();
        let mut tree = Tree::new(root_name);
        let mut contents: HashMap<Utf8PathBuf, Vec<u8>> = HashMap::new();

        tracing::debug!(archive = %self.path, "ZIP: decoding members");
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).context("reading zip entry")?;
            let raw_name = file.name().to_string();
            let rel_path = Utf8PathBuf::from(raw_name.trim_end_matches('/'));
            if rel_path.as_str().is_empty() {
                continue;
            }

            let name = rel_path
                .file_name()
                .unwrap_or(rel_path.as_str())
                .to_string();
            let mode = file.unix_mode();
            let permissions = mode.map(|m| m & 0o7777);

            if file.is_dir() {
                tree.insert(
                    rel_path,
                    Entry::Directory(DirEntry {
                        name,
                        metadata: Metadata {
                            permissions,
                            ..Default::default()
                        },
                    }),
                );
            } else if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                let mut target = String::new();
                file.read_to_string(&mut target)
                    .context("reading symlink target")?;
                tree.insert(
                    rel_path,
                    Entry::Symlink(SymlinkEntry {
                        name,
                        metadata: Metadata::default(),
                        link_target: target,
                    }),
                );
            } else {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).context("reading file data")?;
                contents.insert(rel_path.clone(), buf);
                tree.insert(
                    rel_path,
                    Entry::File(FileEntry {
                        name,
                        metadata: Metadata {
                            permissions,
                            ..Default::default()
                        },
                    }),
                );
            }
        }
        tracing::debug!(archive = %self.path, entries = tree.len(), "ZIP: decoding completed");

        Ok(ZipState {
            tree,
            contents: Mutex::new(contents),
        })
    }

    fn state(&self) -> Result<&ZipState> {
        if let Some(s) = self.state.get() {
            return Ok(s);
        }
        let built = self.build_state()?;
        Ok(self.state.get_or_init(|| built))
    }
}

fn has_zip_magic(path: &Utf8Path) -> bool {
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 2];
    std::io::Read::read_exact(&mut f, &mut magic).is_ok() && magic == [b'P', b'K']
}

impl Adapter for ZipAdapter {
    fn tree(&self) -> Result<&Tree> {
        Ok(&self.state()?.tree)
    }

    fn expand(&self, relative_path: Option<&Utf8Path>, extraction_root: &Utf8Path) -> Result<()> {
        let state = self.state()?;

        match relative_path {
            None => {
                std::fs::create_dir_all(extraction_root)
                    .with_context(|| format!("creating {extraction_root}"))?;
                let mut paths: Vec<_> = state.tree.paths().collect();
                paths.sort();
                for path in paths {
                    self.expand(Some(path.as_path()), extraction_root)?;
                }
                Ok(())
            }
            Some(rel) => {
                let entry = state
                    .tree
                    .get(rel)
                    .ok_or_else(|| DirPatchError::MissingEntry(self.path.join(rel)))?;
                let target = extraction_root.join(rel);

                match entry {
                    Entry::Symlink(s) => recreate_symlink(&target, &s.link_target),
                    Entry::Directory(d) => {
                        std::fs::create_dir_all(&target)
                            .with_context(|| format!("creating directory {target}"))?;
                        let _ = apply_permissions(&target, &d.metadata);
                        Ok(())
                    }
                    Entry::File(f) => {
                        if let Some(parent) = target.parent() {
                            std::fs::create_dir_all(parent)
                                .with_context(|| format!("creating directory {parent}"))?;
                        }
                        let contents = state.contents.lock().unwrap();
                        let bytes = contents
                            .get(rel)
                            .ok_or_else(|| DirPatchError::MissingEntry(self.path.join(rel)))?;
                        std::fs::write(&target, bytes)
                            .with_context(|| format!("writing {target}"))?;
                        apply_permissions(&target, &f.metadata)?;
                        Ok(())
                    }
                }
            }
        }
    }

    fn create_from(&self, base_dir: &Utf8Path) -> Result<()> {
        if self.path.exists() {
            return Err(DirPatchError::AlreadyExists(self.path.clone()).into());
        }
        let file = std::fs::File::create(&self.path)
            .with_context(|| format!("creating {}", self.path))?;
        let mut writer = ::zip::ZipWriter::new(file);

        let mut entries = Vec::new();
        collect(base_dir, Utf8Path::new(""), &mut entries)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::debug!(archive = %self.path, entries = entries.len(), "ZIP: writing members");
        for (rel, abs, meta) in entries {
            let file_type = meta.file_type();
            let mode = std::os::unix::fs::PermissionsExt::mode(&meta.permissions());

            if file_type.is_dir() {
                let options = ::zip::write::FileOptions::<()>::default()
                    .compression_method(::zip::CompressionMethod::Stored)
                    .unix_permissions(mode & 0o7777);
                writer
                    .add_directory(format!("{rel}/"), options)
                    .with_context(|| format!("adding directory {rel}"))?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(&abs)
                    .with_context(|| format!("reading symlink {abs}"))?;
                let options = ::zip::write::FileOptions::<()>::default()
                    .compression_method(::zip::CompressionMethod::Stored)
                    .unix_permissions(S_IFLNK | 0o777);
                writer
                    .start_file(rel.as_str(), options)
                    .with_context(|| format!("starting symlink entry {rel}"))?;
                let target_str = target
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("non-UTF8 symlink target at {abs}"))?;
                std::io::Write::write_all(&mut writer, target_str.as_bytes())
                    .with_context(|| format!("writing symlink target {rel}"))?;
            } else {
                let options = ::zip::write::FileOptions::<()>::default()
                    .compression_method(::zip::CompressionMethod::Deflated)
                    .unix_permissions(mode & 0o7777);
                writer
                    .start_file(rel.as_str(), options)
                    .with_context(|| format!("starting file entry {rel}"))?;
                let mut f = std::fs::File::open(&abs).with_context(|| format!("opening {abs}"))?;
                std::io::copy(&mut f, &mut writer)
                    .with_context(|| format!("writing file entry {rel}"))?;
            }
        }

        writer.finish().context("finishing zip stream")?;
        Ok(())
    }
}

fn collect(
    abs_dir: &Utf8Path,
    rel_dir: &Utf8Path,
    out: &mut Vec<(Utf8PathBuf, Utf8PathBuf, std::fs::Metadata)>,
) -> Result<()> {
    for entry in std::fs::read_dir(abs_dir).with_context(|| format!("reading {abs_dir}"))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let abs_path = Utf8PathBuf::try_from(entry.path())?;
        let rel_path = if rel_dir.as_str().is_empty() {
            Utf8PathBuf::from(&name)
        } else {
            rel_dir.join(&name)
        };
        let meta = std::fs::symlink_metadata(&abs_path)?;
        if meta.is_dir() {
            out.push((rel_path.clone(), abs_path.clone(), meta));
            collect(&abs_path, &rel_path, out)?;
        } else {
            out.push((rel_path, abs_path, meta));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_files_and_dirs() {
        let src = tempfile::tempdir().unwrap();
        let src_root = Utf8Path::from_path(src.path()).unwrap();
        std::fs::create_dir_all(src_root.join("a")).unwrap();
        std::fs::write(src_root.join("a/file"), b"hello").unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = Utf8PathBuf::try_from(archive_dir.path().join("bundle.zip")).unwrap();

        let writer = ZipAdapter::create(&archive_path).unwrap();
        writer.create_from(src_root).unwrap();

        let reader = ZipAdapter::open(&archive_path).unwrap();
        let tree = reader.tree().unwrap();
        assert!(tree.contains(Utf8Path::new("a")));
        assert!(tree.contains(Utf8Path::new("a/file")));

        let out = tempfile::tempdir().unwrap();
        let out_root = Utf8Path::from_path(out.path()).unwrap();
        reader.expand(None, out_root).unwrap();
        assert_eq!(
            std::fs::read_to_string(out_root.join("a/file")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn create_from_refuses_existing_archive() {
        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = Utf8PathBuf::try_from(archive_dir.path().join("bundle.zip")).unwrap();
        std::fs::write(&archive_path, b"PK\x03\x04").unwrap();

        let err = ZipAdapter::create(&archive_path).unwrap_err();
        assert!(err.downcast_ref::<DirPatchError>().is_some());
    }
}
