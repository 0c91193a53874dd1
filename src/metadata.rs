//! Shared permission/ownership restoration helpers.
//!
//! Used by both the diff engine (copying attributes straight off the new
//! file on disk) and the apply engine (copying attributes recorded in the
//! bundle's tree). Ownership restoration tolerates `EPERM` the way the
//! original's `except PermissionError: pass` does. Callers decide whether
//! that's fatal via `ignore_euid`.

use std::os::unix::fs::{symlink, PermissionsExt};

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::tree::Metadata;

/// Apply `chmod` if permissions are known; a no-op for symlinks (the caller
/// is expected not to call this for symlink targets, since symlink modes
/// aren't meaningfully settable on Linux).
pub fn apply_permissions(target: &Utf8Path, metadata: &Metadata) -> Result<()> {
    if let Some(mode) = metadata.permissions {
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {target}"))?;
    }
    Ok(())
}

/// Apply `lchown` if uid/gid are known. Returns `Ok(())` silently on
/// `EPERM`/`EACCES` when `ignore_euid` is set, since restoring ownership
/// without root is expected to fail in that mode; otherwise propagates.
pub fn apply_ownership(target: &Utf8Path, metadata: &Metadata, ignore_euid: bool) -> Result<()> {
    let (Some(uid), Some(gid)) = (metadata.uid, metadata.gid) else {
        return Ok(());
    };

    match lchown(target, uid, gid) {
        Ok(()) => Ok(()),
        Err(err) if ignore_euid && is_permission_denied(&err) => {
            tracing::debug!(%target, "ignoring lchown failure under --ignore-euid: {err}");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("lchown {target}")),
    }
}

fn is_permission_denied(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPERM) | Some(libc::EACCES)
    )
}

fn lchown(target: &Utf8Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let c_path = std::ffi::CString::new(target.as_str())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Stat `source` and apply its mode/ownership onto `target`. Mirrors the
/// original's `copy_attributes`: used by the diff engine to carry a staged
/// new file's attributes onto the freshly-encoded delta file.
pub fn copy_attributes(source: &Utf8Path, target: &Utf8Path, ignore_euid: bool) -> Result<()> {
    let stat = std::fs::symlink_metadata(source).with_context(|| format!("stat {source}"))?;
    if stat.file_type().is_symlink() {
        return Ok(());
    }
    let metadata = Metadata {
        permissions: Some(
            std::os::unix::fs::PermissionsExt::mode(&stat.permissions()) & 0o7777,
        ),
        uid: Some(std::os::unix::fs::MetadataExt::uid(&stat)),
        gid: Some(std::os::unix::fs::MetadataExt::gid(&stat)),
        owner_name: None,
        group_name: None,
    };
    apply_permissions(target, &metadata)?;
    apply_ownership(target, &metadata, ignore_euid)
}

/// Recreate a symlink at `target` pointing at `link_target`, creating the
/// parent directory first. Mirrors every adapter's symlink-materialization
/// step (4.1: "creates a symbolic link with the stored target verbatim").
pub fn recreate_symlink(target: &Utf8Path, link_target: &str) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory {parent}"))?;
    }
    if target.is_symlink() || target.exists() {
        std::fs::remove_file(target).with_context(|| format!("removing existing {target}"))?;
    }
    symlink(link_target, target).with_context(|| format!("symlinking {target} -> {link_target}"))
}
