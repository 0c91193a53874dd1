pub mod adapter;
pub mod apply;
pub mod bundle;
pub mod cli;
pub mod diff;
pub mod error;
pub mod metadata;
pub mod runner;
pub mod tree;
pub mod users;
pub mod xdelta;

pub use error::DirPatchError;

/// End-to-end diff/apply scenarios. These exercise the full pipeline
/// against a real `xdelta3` binary, so they skip (rather than fail) when
/// one isn't resolvable, since the binary is an external dependency the
/// engine never vendors.
#[cfg(test)]
mod integration_tests {
    use camino::{Utf8Path, Utf8PathBuf};

    use crate::apply::{self, ApplyOptions};
    use crate::diff::{self, DiffOptions};

    fn xdelta3_available() -> bool {
        std::env::var("XDIRPATCH_XDELTA3")
            .ok()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from("lib/xdelta3"))
            .exists()
            || which_on_path("xdelta3")
    }

    fn which_on_path(bin: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file())
            })
            .unwrap_or(false)
    }

    fn diff_opts(staging: &Utf8Path) -> DiffOptions {
        DiffOptions {
            staging_dir: staging.to_owned(),
            workers: Some(2),
            metadata_file: None,
        }
    }

    fn apply_opts(staging: &Utf8Path) -> ApplyOptions {
        ApplyOptions {
            staging_dir: staging.to_owned(),
            workers: Some(2),
            sub_path: None,
            ignore_euid: true,
        }
    }

    #[test]
    fn single_file_change_round_trips() {
        if !xdelta3_available() {
            eprintln!("skipping: no xdelta3 binary resolvable");
            return;
        }

        let old = tempfile::tempdir().unwrap();
        let old_root = Utf8Path::from_path(old.path()).unwrap();
        std::fs::write(old_root.join("a.txt"), b"version one\n").unwrap();

        let new = tempfile::tempdir().unwrap();
        let new_root = Utf8Path::from_path(new.path()).unwrap();
        std::fs::write(new_root.join("a.txt"), b"version two, changed\n").unwrap();

        let bundle_dir = tempfile::tempdir().unwrap();
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().join("bundle.tar.gz")).unwrap();
        let diff_staging = tempfile::tempdir().unwrap();
        diff::diff(
            old_root,
            new_root,
            &bundle_path,
            &diff_opts(Utf8Path::from_path(diff_staging.path()).unwrap()),
        )
        .unwrap();

        let target = tempfile::tempdir().unwrap();
        let target_root = Utf8Path::from_path(target.path()).unwrap();
        let apply_staging = tempfile::tempdir().unwrap();
        apply::apply(
            old_root,
            &bundle_path,
            target_root,
            &apply_opts(Utf8Path::from_path(apply_staging.path()).unwrap()),
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(target_root.join("a.txt")).unwrap(),
            "version two, changed\n"
        );
    }

    #[test]
    fn nested_removal_is_applied() {
        if !xdelta3_available() {
            eprintln!("skipping: no xdelta3 binary resolvable");
            return;
        }

        let old = tempfile::tempdir().unwrap();
        let old_root = Utf8Path::from_path(old.path()).unwrap();
        std::fs::create_dir_all(old_root.join("keep")).unwrap();
        std::fs::write(old_root.join("keep/stays.txt"), b"stays\n").unwrap();
        std::fs::create_dir_all(old_root.join("gone/deeper")).unwrap();
        std::fs::write(old_root.join("gone/deeper/leaf.txt"), b"leaf\n").unwrap();

        let new = tempfile::tempdir().unwrap();
        let new_root = Utf8Path::from_path(new.path()).unwrap();
        std::fs::create_dir_all(new_root.join("keep")).unwrap();
        std::fs::write(new_root.join("keep/stays.txt"), b"stays\n").unwrap();

        let bundle_dir = tempfile::tempdir().unwrap();
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().join("bundle.tar.gz")).unwrap();
        let diff_staging = tempfile::tempdir().unwrap();
        diff::diff(
            old_root,
            new_root,
            &bundle_path,
            &diff_opts(Utf8Path::from_path(diff_staging.path()).unwrap()),
        )
        .unwrap();

        let apply_staging = tempfile::tempdir().unwrap();
        apply::apply(
            old_root,
            &bundle_path,
            old_root,
            &apply_opts(Utf8Path::from_path(apply_staging.path()).unwrap()),
        )
        .unwrap();

        assert!(old_root.join("keep/stays.txt").exists());
        assert!(!old_root.join("gone").exists());
    }

    #[test]
    fn symlink_is_preserved_through_bundle() {
        if !xdelta3_available() {
            eprintln!("skipping: no xdelta3 binary resolvable");
            return;
        }

        let old = tempfile::tempdir().unwrap();
        let old_root = Utf8Path::from_path(old.path()).unwrap();
        std::fs::write(old_root.join("target.txt"), b"hi\n").unwrap();
        std::os::unix::fs::symlink("target.txt", old_root.join("link")).unwrap();

        let new = tempfile::tempdir().unwrap();
        let new_root = Utf8Path::from_path(new.path()).unwrap();
        std::fs::write(new_root.join("target.txt"), b"hi\n").unwrap();
        std::os::unix::fs::symlink("target.txt", new_root.join("link")).unwrap();

        let bundle_dir = tempfile::tempdir().unwrap();
        let bundle_path = Utf8PathBuf::try_from(bundle_dir.path().join("bundle.tar.gz")).unwrap();
        let diff_staging = tempfile::tempdir().unwrap();
        diff::diff(
            old_root,
            new_root,
            &bundle_path,
            &diff_opts(Utf8Path::from_path(diff_staging.path()).unwrap()),
        )
        .unwrap();

        let target = tempfile::tempdir().unwrap();
        let target_root = Utf8Path::from_path(target.path()).unwrap();
        let apply_staging = tempfile::tempdir().unwrap();
        apply::apply(
            old_root,
            &bundle_path,
            target_root,
            &apply_opts(Utf8Path::from_path(apply_staging.path()).unwrap()),
        )
        .unwrap();

        let link_target = std::fs::read_link(target_root.join("link")).unwrap();
        assert_eq!(link_target.to_str().unwrap(), "target.txt");
    }
}
