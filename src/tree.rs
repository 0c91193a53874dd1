//! The uniform in-memory snapshot representation shared by every adapter.
//!
//! Mirrors the tagged-variant rewrite called for in the design notes: the
//! original implementation kept a dynamic `DirListing`/`AttributeDict` pair
//! with ad hoc attribute access, which we replace with an `Entry` enum
//! carrying only the fields each kind needs.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;

/// Semantic metadata common to every entry kind. Adapter-specific fields
/// (tar mtime, zip CRC, absolute filesystem path, ...) never leak past the
/// adapter boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner_name: Option<String>,
    pub group_name: Option<String>,
}

impl Metadata {
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct SymlinkEntry {
    pub name: String,
    pub metadata: Metadata,
    pub link_target: String,
}

/// A single node in a snapshot tree.
///
/// Symlinks that point at directories are still classified as leaves here:
/// the filesystem adapter never recurses through them (see `adapter::filesystem`).
#[derive(Debug, Clone)]
pub enum Entry {
    Directory(DirEntry),
    File(FileEntry),
    Symlink(SymlinkEntry),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::Directory(d) => &d.name,
            Entry::File(f) => &f.name,
            Entry::Symlink(s) => &s.name,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Entry::Directory(d) => &d.metadata,
            Entry::File(f) => &f.metadata,
            Entry::Symlink(s) => &s.metadata,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Entry::Symlink(_))
    }

    pub fn link_target(&self) -> Option<&str> {
        match self {
            Entry::Symlink(s) => Some(s.link_target.as_str()),
            _ => None,
        }
    }
}

/// A snapshot tree: a synthetic root plus a flat, order-preserving map from
/// relative path to entry.
///
/// The root is keyed out-of-band (it is never a key in `nodes`), using a
/// distinguished absent value rather than the empty string; `Tree::root_name`
/// plays that role for rendering.
#[derive(Debug, Clone)]
pub struct Tree {
    root_name: String,
    nodes: IndexMap<Utf8PathBuf, Entry>,
}

impl Tree {
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            root_name: root_name.into(),
            nodes: IndexMap::new(),
        }
    }

    /// Insert an entry at `relative_path`, normalizing away any trailing
    /// separator so a given path appears in the map exactly once.
    pub fn insert(&mut self, relative_path: Utf8PathBuf, entry: Entry) {
        let normalized = normalize(&relative_path);
        self.nodes.insert(normalized, entry);
    }

    pub fn contains(&self, relative_path: &Utf8Path) -> bool {
        self.nodes.contains_key(&normalize(relative_path))
    }

    pub fn get(&self, relative_path: &Utf8Path) -> Option<&Entry> {
        self.nodes.get(&normalize(relative_path))
    }

    /// Iterate entries in the adapter's native order (insertion order:
    /// archive member order for tar, sorted-walk order for filesystem/zip).
    pub fn iter(&self) -> impl Iterator<Item = (&Utf8PathBuf, &Entry)> {
        self.nodes.iter()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8PathBuf> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Human-readable depth-first rendering used only for diagnostics
    /// (`--debug`). Deterministic for a given tree regardless of the
    /// underlying map's insertion order.
    pub fn render(&self) -> String {
        let mut sorted: Vec<&Utf8PathBuf> = self.nodes.keys().collect();
        sorted.sort();

        let mut out = String::new();
        let _ = writeln!(out, "{}", "-".repeat(70));
        let _ = writeln!(out, "v {}", self.root_name);
        for path in sorted {
            let entry = &self.nodes[path];
            let depth = path.components().count().saturating_sub(1);
            let marker = if entry.is_directory() { "v" } else { "-" };
            let _ = writeln!(
                out,
                "{}{} {} {}",
                "| ".repeat(depth),
                marker,
                format_permissions(entry.metadata().permissions),
                format_name(entry)
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(70));
        out
    }
}

impl std::fmt::Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn format_name(entry: &Entry) -> String {
    match entry {
        Entry::Symlink(s) => format!("{} -> {}", s.name, s.link_target),
        other => other.name().to_string(),
    }
}

fn format_permissions(permissions: Option<u32>) -> String {
    let Some(mode) = permissions else {
        return " ".repeat(9);
    };
    const LETTERS: [char; 9] = ['r', 'w', 'x', 'r', 'w', 'x', 'r', 'w', 'x'];
    const MASKS: [u32; 9] = [
        0o400, 0o200, 0o100, 0o040, 0o020, 0o010, 0o004, 0o002, 0o001,
    ];
    LETTERS
        .iter()
        .zip(MASKS)
        .map(|(l, m)| if mode & m != 0 { *l } else { '-' })
        .collect()
}

/// Strip a trailing separator (as left by tar directory members) so a path
/// appears in the map exactly once.
fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let s = path.as_str();
    if let Some(stripped) = s.strip_suffix('/') {
        Utf8PathBuf::from(stripped)
    } else {
        path.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_deterministic_regardless_of_insertion_order() {
        let mut a = Tree::new("root");
        a.insert(
            Utf8PathBuf::from("b"),
            Entry::File(FileEntry {
                name: "b".into(),
                metadata: Metadata::with_permissions(0o644),
            }),
        );
        a.insert(
            Utf8PathBuf::from("a"),
            Entry::Directory(DirEntry {
                name: "a".into(),
                metadata: Metadata::with_permissions(0o755),
            }),
        );

        let mut b = Tree::new("root");
        b.insert(
            Utf8PathBuf::from("a"),
            Entry::Directory(DirEntry {
                name: "a".into(),
                metadata: Metadata::with_permissions(0o755),
            }),
        );
        b.insert(
            Utf8PathBuf::from("b"),
            Entry::File(FileEntry {
                name: "b".into(),
                metadata: Metadata::with_permissions(0o644),
            }),
        );

        assert_eq!(a.render(), b.render());
        assert!(a.render().contains("rwxr-xr-x"));
        assert!(a.render().contains("rw-r--r--"));
    }

    #[test]
    fn normalizes_trailing_separator() {
        let mut t = Tree::new("root");
        t.insert(
            Utf8PathBuf::from("dir/"),
            Entry::Directory(DirEntry {
                name: "dir".into(),
                metadata: Metadata::default(),
            }),
        );
        assert!(t.contains(Utf8Path::new("dir")));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn symlink_rendering_shows_target() {
        let mut t = Tree::new("root");
        t.insert(
            Utf8PathBuf::from("link"),
            Entry::Symlink(SymlinkEntry {
                name: "link".into(),
                metadata: Metadata::default(),
                link_target: "elsewhere".into(),
            }),
        );
        assert!(t.render().contains("link -> elsewhere"));
    }
}
