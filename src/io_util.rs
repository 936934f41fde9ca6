//! Small filesystem helpers shared by the catalog and the transport.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;

use crate::ctx;

/// Copy the lowest 9 mode bits of `reference` onto `target`.
pub fn copy_mode_bits(reference: &Path, target: &Path) -> Result<()> {
    let mode = fs::metadata(reference)
        .map_err(ctx!("reading mode of {reference:?}"))?
        .permissions()
        .mode()
        & 0o777;
    set_mode_bits(target, mode)
}

pub fn set_mode_bits(target: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
        .map_err(ctx!("setting mode of {target:?}"))
}

/// Add the executable bits (user, group, other) to a file.
pub fn make_executable(path: &Path) -> Result<()> {
    let mode = fs::metadata(path)
        .map_err(ctx!("reading mode of {path:?}"))?
        .permissions()
        .mode();
    set_mode_bits(path, (mode | 0o111) & 0o7777)
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(ctx!("creating {dst:?}"))?;
    copy_mode_bits(src, dst)?;
    for entry in fs::read_dir(src).map_err(ctx!("reading {src:?}"))? {
        let entry = entry.map_err(ctx!("reading an entry of {src:?}"))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(ctx!("copying {from:?} to {to:?}"))?;
        }
    }
    Ok(())
}

/// Move a directory, falling back to copy + delete when the rename
/// crosses a filesystem boundary.
pub fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(src, dst)?;
            fs::remove_dir_all(src).map_err(ctx!("removing {src:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_move_dir() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/x.txt"), b"x").unwrap();
        let dst = dir.path().join("b");
        move_dir(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("sub/x.txt")).unwrap(), b"x");
    }

    #[test]
    fn t_make_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        make_executable(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
