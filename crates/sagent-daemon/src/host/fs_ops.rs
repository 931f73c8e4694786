//! Recursive filesystem operations for contract trees.
//!
//! These replace the original shell round-trips (`cp -r`, `mv`,
//! `chown -R`, `chmod -R`) with in-process recursion, so no user-derived
//! path ever reaches a shell. Symlinks inside a template are recreated as
//! links, never followed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::{HostError, resolve_user};

/// Copies the contents of `src` into `dst`, creating `dst` if needed.
///
/// # Errors
///
/// Returns [`HostError::Io`] on the first failing operation.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), HostError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves `src` onto `dst`. Falls back to copy-and-delete when the rename
/// crosses filesystems (the scratch dir lives under `/tmp`, contract homes
/// usually do not).
///
/// # Errors
///
/// Returns [`HostError::Io`] on failure; on the fallback path a partially
/// written `dst` is removed before the error is returned.
pub fn move_dir(src: &Path, dst: &Path) -> Result<(), HostError> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) => {
            if let Err(copy_err) = copy_tree(src, dst) {
                let _ = fs::remove_dir_all(dst);
                return Err(copy_err);
            }
            fs::remove_dir_all(src)?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Recursively transfers ownership of `path` to `username` and its primary
/// group.
///
/// # Errors
///
/// Returns [`HostError::UnknownUser`] or [`HostError::Io`].
pub fn chown_r(username: &str, path: &Path) -> Result<(), HostError> {
    let user = resolve_user(username)?;
    chown_recursive(path, user.uid.as_raw(), user.gid.as_raw())
}

fn chown_recursive(path: &Path, uid: u32, gid: u32) -> Result<(), HostError> {
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    if path.is_dir() && !path.is_symlink() {
        for entry in fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Recursively sets the permission bits of every entry under `path`.
///
/// # Errors
///
/// Returns [`HostError::Io`] on the first failing operation.
pub fn chmod_r(mode: u32, path: &Path) -> Result<(), HostError> {
    if !path.is_symlink() {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    if path.is_dir() && !path.is_symlink() {
        for entry in fs::read_dir(path)? {
            chmod_r(mode, &entry?.path())?;
        }
    }
    Ok(())
}
