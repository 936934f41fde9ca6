//! The local-filesystem backend, used when no remote host is
//! configured. Semantics match the SFTP backend: recursive
//! send/receive with mode-bit copies, mtime-based skip in non-replace
//! sends, on-demand directory creation.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::SystemTime,
};

use anyhow::anyhow;

use crate::{ctx, io_util};

use super::{RemoteError, RemoteFolderConfig};

pub struct LocalFolder {
    working_directory: Option<PathBuf>,
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

impl LocalFolder {
    pub fn new(config: &RemoteFolderConfig) -> Self {
        Self {
            working_directory: config.working_directory.clone(),
        }
    }

    /// Resolve a "remote" path against the working directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.working_directory {
            Some(wd) => wd.join(path),
            None => path.to_owned(),
        }
    }

    fn send_file(
        &self,
        local: &Path,
        remote: &Path,
        replace: bool,
        delete: bool,
    ) -> Result<(), RemoteError> {
        if !replace {
            if let (Some(local_mtime), Some(remote_mtime)) = (mtime(local), mtime(remote)) {
                if local_mtime <= remote_mtime {
                    return Ok(());
                }
            }
        }
        if let Some(parent) = remote.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                fs::create_dir_all(parent).map_err(ctx!("creating {parent:?}"))?;
            }
        }
        fs::copy(local, remote).map_err(ctx!("copying {local:?} to {remote:?}"))?;
        io_util::copy_mode_bits(local, remote)?;
        if delete {
            fs::remove_file(local).map_err(ctx!("removing {local:?}"))?;
        }
        Ok(())
    }

    fn send_resolved(
        &self,
        local: &Path,
        remote: &Path,
        replace: bool,
        delete: bool,
    ) -> Result<(), RemoteError> {
        if local.is_file() {
            self.send_file(local, remote, replace, delete)?;
        } else {
            for entry in fs::read_dir(local).map_err(ctx!("reading {local:?}"))? {
                let entry = entry.map_err(ctx!("reading an entry of {local:?}"))?;
                self.send_resolved(
                    &entry.path(),
                    &remote.join(entry.file_name()),
                    replace,
                    delete,
                )?;
            }
            if delete {
                fs::remove_dir(local).map_err(ctx!("removing {local:?}"))?;
            }
        }
        Ok(())
    }

    pub fn send(
        &mut self,
        local: &Path,
        remote: &Path,
        replace: bool,
        delete: bool,
    ) -> Result<(), RemoteError> {
        self.send_resolved(local, &self.resolve(remote), replace, delete)
    }

    fn receive_resolved(
        &self,
        remote: &Path,
        local: &Path,
        delete: bool,
    ) -> Result<(), RemoteError> {
        if !remote.exists() {
            return Err(RemoteError::RemotePathNotFound(remote.to_owned()));
        }
        if remote.is_dir() {
            fs::create_dir_all(local).map_err(ctx!("creating {local:?}"))?;
            io_util::copy_mode_bits(remote, local)?;
            for entry in fs::read_dir(remote).map_err(ctx!("reading {remote:?}"))? {
                let entry = entry.map_err(ctx!("reading an entry of {remote:?}"))?;
                self.receive_resolved(&entry.path(), &local.join(entry.file_name()), delete)?;
            }
            if delete {
                fs::remove_dir(remote).map_err(ctx!("removing {remote:?}"))?;
            }
        } else {
            if let Some(parent) = local.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    fs::create_dir_all(parent).map_err(ctx!("creating {parent:?}"))?;
                }
            }
            fs::copy(remote, local).map_err(ctx!("copying {remote:?} to {local:?}"))?;
            io_util::copy_mode_bits(remote, local)?;
            if delete {
                fs::remove_file(remote).map_err(ctx!("removing {remote:?}"))?;
            }
        }
        Ok(())
    }

    pub fn receive(&mut self, remote: &Path, local: &Path, delete: bool) -> Result<(), RemoteError> {
        self.receive_resolved(&self.resolve(remote), local, delete)
    }

    pub fn delete_remote(&mut self, path: &Path) -> Result<(), RemoteError> {
        let path = self.resolve(path);
        if !path.exists() {
            return Err(RemoteError::RemotePathNotFound(path));
        }
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(ctx!("removing {path:?}"))?;
        } else {
            fs::remove_file(&path).map_err(ctx!("removing {path:?}"))?;
        }
        Ok(())
    }

    pub fn get_file_contents(&mut self, path: &Path) -> Result<String, RemoteError> {
        let path = self.resolve(path);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RemoteError::RemotePathNotFound(path))
            }
            Err(e) => Err(anyhow!("reading {path:?}: {e}").into()),
        }
    }

    pub fn put_file_contents(&mut self, path: &Path, text: &str) -> Result<(), RemoteError> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                fs::create_dir_all(parent).map_err(ctx!("creating {parent:?}"))?;
            }
        }
        fs::write(&path, text).map_err(ctx!("writing {path:?}"))?;
        Ok(())
    }

    pub fn execute(&mut self, cmd: &str) -> Result<String, RemoteError> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        if let Some(wd) = &self.working_directory {
            command.current_dir(wd);
        }
        let output = command.output().map_err(ctx!("running {cmd:?}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteFolder;

    fn remote_in(dir: &Path) -> RemoteFolder {
        RemoteFolder::new(RemoteFolderConfig {
            host: None,
            user: None,
            port: None,
            working_directory: Some(dir.join("remote")),
        })
    }

    #[test]
    fn t_send_and_receive_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = remote_in(dir.path());
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();

        let src = dir.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("sub/b.txt"), b"b").unwrap();

        let sent = remote.send(&src, None, false, false).unwrap();
        assert_eq!(sent, PathBuf::from("src"));
        assert!(dir.path().join("remote/src/sub/b.txt").is_file());

        let back = dir.path().join("back");
        remote
            .receive(Path::new("src"), Some(&back), true)
            .unwrap();
        assert_eq!(fs::read(back.join("sub/b.txt")).unwrap(), b"b");
        // the remote copy was deleted on the way
        assert!(!dir.path().join("remote/src").exists());
    }

    #[test]
    fn t_send_skips_older_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = remote_in(dir.path());

        let src = dir.path().join("f.txt");
        fs::write(&src, b"v1").unwrap();
        remote.send(&src, None, false, false).unwrap();

        // destination is now at least as recent: a non-replace send
        // leaves it alone even though the source content changed
        fs::write(dir.path().join("remote/f.txt"), b"kept").unwrap();
        remote.send(&src, None, false, false).unwrap();
        assert_eq!(fs::read(dir.path().join("remote/f.txt")).unwrap(), b"kept");

        remote.send(&src, None, true, false).unwrap();
        assert_eq!(fs::read(dir.path().join("remote/f.txt")).unwrap(), b"v1");
    }

    #[test]
    fn t_missing_remote_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = remote_in(dir.path());
        assert!(matches!(
            remote.receive(Path::new("nope"), None, false),
            Err(RemoteError::RemotePathNotFound(_))
        ));
        assert!(matches!(
            remote.get_file_contents(Path::new("nope.txt")),
            Err(RemoteError::RemotePathNotFound(_))
        ));
    }

    #[test]
    fn t_file_contents_and_execute() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = remote_in(dir.path());
        remote
            .put_file_contents(Path::new("notes/x.txt"), "hello")
            .unwrap();
        assert_eq!(
            remote.get_file_contents(Path::new("notes/x.txt")).unwrap(),
            "hello"
        );
        let out = remote.execute("cat notes/x.txt").unwrap();
        assert_eq!(out, "hello");
    }
}
