//! Best-effort uid/gid → name resolution for the filesystem adapter.
//!
//! Plain `lstat` only gives numeric ids; the original implementation
//! resolves names via `pwd.getpwuid`/`grp.getgrgid` and tolerates lookup
//! failure (deleted user, container without `/etc/passwd` entries, etc).
//! We do the same via libc's reentrant lookup functions.

use std::ffi::CStr;

/// Resolve a uid to a username, returning `None` if there is no such user
/// (this is routine, not an error, e.g. files owned by a uid that no
/// longer has a passwd entry).
pub fn user_name(uid: u32) -> Option<String> {
    let mut buf = vec![0_i8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getpwuid_r(
                uid,
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        break;
    }

    if result.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

/// Resolve a gid to a group name, returning `None` if there is no such group.
pub fn group_name(gid: u32) -> Option<String> {
    let mut buf = vec![0_i8; 1024];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();

    loop {
        let rc = unsafe {
            libc::getgrgid_r(
                gid,
                &mut grp,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        break;
    }

    if result.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(grp.gr_name) };
    Some(name.to_string_lossy().into_owned())
}
