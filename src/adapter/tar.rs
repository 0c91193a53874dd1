//! `tar.gz` adapter.
//!
//! Grounded directly on chunkah's `tar.rs`: gzip-compressed tar read via
//! `flate2::read::GzDecoder` + `tar::Archive`, write via
//! `flate2::write::GzEncoder` + `tar::Builder`, member order preserved by
//! inserting into the tree in the order entries are read (matching
//! `write_files_to_tar`'s ancestor-directory-then-sorted-children order on
//! write). A gzip stream isn't seekable, so unlike the filesystem adapter
//! the whole archive is decoded once and file contents are cached in a
//! `Mutex`-guarded map, the equivalent of the original's `threading.RLock`
//! around a single shared archive handle, here a lock around the one-time
//! decode result rather than the handle itself.

use std::collections::HashMap;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::sync::{Mutex, OnceLock};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DirPatchError;
use crate::metadata::{apply_ownership, apply_permissions, recreate_symlink};
use crate::tree::{DirEntry, Entry, FileEntry, Metadata, SymlinkEntry, Tree};

use super::Adapter;

#[derive(Debug)]
struct TarState {
    tree: Tree,
    contents: Mutex<HashMap<Utf8PathBuf, Vec<u8>>>,
}

#[derive(Debug)]
pub struct TarAdapter {
    path: Utf8PathBuf,
    state: OnceLock<TarState>,
}

impl TarAdapter {
    pub fn can_open(path: &Utf8Path) -> bool {
        if !path.is_file() {
            return false;
        }
        if path.as_str().ends_with(".tar.gz") || path.as_str().ends_with(".tgz") {
            return true;
        }
        has_gzip_magic(path)
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

    fn build_state(&self) -> Result<TarState> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening {}", self.path))?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);

        let root_name = self
            .path
            .file_name()
            .unwrap_or(self.path.as_str())
            .to_string();
        let mut tree = Tree::new(root_name);
        let mut contents: HashMap<Utf8PathBuf, Vec<u8>> = HashMap::new();

        tracing::debug!(archive = %self.path, "TAR: decoding members");
        for entry in archive.entries().context("reading tar entries")? {
            let mut entry = entry.context("reading tar entry")?;
            let header = entry.header().clone();
            let raw_path = entry.path().context("reading entry path")?.into_owned();
            let rel_path = Utf8PathBuf::try_from(raw_path)
                .map_err(|e| anyhow::anyhow!("non-UTF8 path in archive: {e}"))?;
            let rel_path = match rel_path.as_str().strip_suffix('/') {
                Some(stripped) => Utf8PathBuf::from(stripped),
                None => rel_path,
            };

            ensure_parents(&mut tree, &rel_path);

            let name = rel_path
                .file_name()
                .unwrap_or(rel_path.as_str())
                .to_string();
            let metadata = Metadata {
                permissions: Some((header.mode().unwrap_or(0o644)) & 0o7777),
                uid: Some(header.uid().unwrap_or(0) as u32),
                gid: Some(header.gid().unwrap_or(0) as u32),
                owner_name: header.username().ok().flatten().map(str::to_owned),
                group_name: header.groupname().ok().flatten().map(str::to_owned),
            };

            match header.entry_type() {
                tar::EntryType::Directory => {
                    tree.insert(rel_path, Entry::Directory(DirEntry { name, metadata }));
                }
                tar::EntryType::Symlink => {
                    let target = header
                        .link_name()
                        .context("reading symlink target")?
                        .ok_or_else(|| anyhow::anyhow!("symlink entry missing target"))?
                        .into_owned();
                    let target = Utf8PathBuf::try_from(target)
                        .map_err(|e| anyhow::anyhow!("non-UTF8 symlink target: {e}"))?;
                    tree.insert(
                        rel_path,
                        Entry::Symlink(SymlinkEntry {
                            name,
                            metadata,
                            link_target: target.to_string(),
                        }),
                    );
                }
                _ => {
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf).context("reading file data")?;
                    contents.insert(rel_path.clone(), buf);
                    tree.insert(rel_path, Entry::File(FileEntry { name, metadata }));
                }
            }
        }
        tracing::debug!(archive = %self.path, entries = tree.len(), "TAR: decoding completed");

        Ok(TarState {
            tree,
            contents: Mutex::new(contents),
        })
    }

    fn state(&self) -> Result<&TarState> {
        if let Some(s) = self.state.get() {
            return Ok(s);
        }
        let built = self.build_state()?;
        Ok(self.state.get_or_init(|| built))
    }
}

fn ensure_parents(tree: &mut Tree, rel_path: &Utf8Path) {
    let mut ancestors: Vec<Utf8PathBuf> = Vec::new();
    let mut cur = rel_path.parent();
    while let Some(p) = cur {
        if p.as_str().is_empty() {
            break;
        }
        ancestors.push(p.to_owned());
        cur = p.parent();
    }
    for ancestor in ancestors.into_iter().rev() {
        if tree.contains(&ancestor) {
            continue;
        }
        let name = ancestor
            .file_name()
            .unwrap_or(ancestor.as_str())
            .to_string();
        tree.insert(
            ancestor,
            Entry::Directory(DirEntry {
                name,
                metadata: Metadata::with_permissions(0o755),
            }),
        );
    }
}

fn has_gzip_magic(path: &Utf8Path) -> bool {
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 2];
    std::io::Read::read_exact(&mut f, &mut magic).is_ok() && magic == [0x1f, 0x8b]
}

impl Adapter for TarAdapter {
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
                        let _ = apply_ownership(&target, &d.metadata, true);
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
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let mut entries = Vec::new();
        collect(base_dir, Utf8Path::new(""), &mut entries)?;
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::debug!(archive = %self.path, entries = entries.len(), "TAR: writing members");
        for (rel, abs, meta) in entries {
            write_entry(&mut builder, &rel, &abs, &meta)?;
        }

        builder
            .into_inner()
            .context("finishing tar stream")?
            .finish()
            .context("finishing gzip stream")?;
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

fn write_entry(
    builder: &mut tar::Builder<GzEncoder<std::fs::File>>,
    rel: &Utf8Path,
    abs: &Utf8Path,
    meta: &std::fs::Metadata,
) -> Result<()> {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let file_type = meta.file_type();
    let mut header = tar::Header::new_gnu();
    header.set_mtime(mtime);
    header.set_uid(meta.uid() as u64);
    header.set_gid(meta.gid() as u64);

    if file_type.is_dir() {
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(meta.mode() & 0o7777);
        header.set_size(0);
        let mut name = rel.as_str().to_string();
        name.push('/');
        header.set_cksum();
        builder
            .append_data(&mut header, name, std::io::empty())
            .with_context(|| format!("appending directory {rel}"))?;
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(abs).with_context(|| format!("reading symlink {abs}"))?;
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, rel.as_str(), &target)
            .with_context(|| format!("appending symlink {rel}"))?;
    } else {
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(meta.mode() & 0o7777);
        header.set_size(meta.len());
        header.set_cksum();
        let mut f = std::fs::File::open(abs).with_context(|| format!("opening {abs}"))?;
        builder
            .append_data(&mut header, rel.as_str(), &mut f)
            .with_context(|| format!("appending file {rel}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source_tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/file"), b"hello").unwrap();
        std::os::unix::fs::symlink("b/file", root.join("a/link")).unwrap();
        tmp
    }

    #[test]
    fn round_trips_files_dirs_and_symlinks() {
        let src_tmp = make_source_tree();
        let src_root = Utf8Path::from_path(src_tmp.path()).unwrap();

        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = Utf8PathBuf::try_from(archive_dir.path().join("bundle.tar.gz")).unwrap();

        let writer = TarAdapter::create(&archive_path).unwrap();
        writer.create_from(src_root).unwrap();

        let reader = TarAdapter::open(&archive_path).unwrap();
        let tree = reader.tree().unwrap();
        assert!(tree.contains(Utf8Path::new("a")));
        assert!(tree.contains(Utf8Path::new("a/b/file")));
        assert!(tree.get(Utf8Path::new("a/link")).unwrap().is_symlink());

        let out = tempfile::tempdir().unwrap();
        let out_root = Utf8Path::from_path(out.path()).unwrap();
        reader.expand(None, out_root).unwrap();

        assert_eq!(
            std::fs::read_to_string(out_root.join("a/b/file")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_link(out_root.join("a/link"))
                .unwrap()
                .to_str()
                .unwrap(),
            "b/file"
        );
    }

    #[test]
    fn create_from_refuses_existing_archive() {
        let archive_dir = tempfile::tempdir().unwrap();
        let archive_path = Utf8PathBuf::try_from(archive_dir.path().join("bundle.tar.gz")).unwrap();
        std::fs::write(&archive_path, b"not really a tarball").unwrap();

        let err = TarAdapter::create(&archive_path).unwrap_err();
        assert!(err.downcast_ref::<DirPatchError>().is_some());
    }
}
