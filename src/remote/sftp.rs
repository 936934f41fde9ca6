//! The SFTP backend (libssh2). Authentication goes through the SSH
//! agent; the host key policy is the system's known_hosts handling as
//! provided by libssh2.

use std::{
    io::{Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use anyhow::{anyhow, Result};
use ssh2::{ErrorCode, FileStat, Session, Sftp};

use crate::ctx;

use super::{RemoteError, RemoteFolderConfig};

/// libssh2 SFTP status codes for missing paths.
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_NO_SUCH_PATH: i32 = 10;

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH)
    )
}

pub struct SftpFolder {
    session: Session,
    sftp: Sftp,
    working_directory: Option<PathBuf>,
}

fn mode_only(mode: u32) -> FileStat {
    FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode & 0o777),
        atime: None,
        mtime: None,
    }
}

impl SftpFolder {
    pub fn connect(config: &RemoteFolderConfig) -> Result<Self, RemoteError> {
        let host = config
            .host
            .clone()
            .ok_or_else(|| anyhow!("the folder sub-config has no `host`"))?;
        let port = config.port.unwrap_or(22);

        let tcp = TcpStream::connect((host.as_str(), port))
            .map_err(ctx!("connecting to {host}:{port}"))?;
        let mut session = Session::new().map_err(ctx!("creating the SSH session"))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(ctx!("SSH handshake with {host}"))?;

        let user = config
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .ok_or_else(|| anyhow!("no `user` configured and no USER in the environment"))?;
        session
            .userauth_agent(&user)
            .map_err(ctx!("authenticating {user}@{host} through the SSH agent"))?;

        let sftp = session.sftp().map_err(ctx!("opening the SFTP channel"))?;
        Ok(Self {
            session,
            sftp,
            working_directory: config.working_directory.clone(),
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.working_directory {
            Some(wd) => wd.join(path),
            None => path.to_owned(),
        }
    }

    /// Recursively create a remote directory.
    fn makedirs(&self, directory: &Path) -> Result<(), RemoteError> {
        match self.sftp.mkdir(directory, 0o755) {
            Ok(()) => Ok(()),
            Err(e) if is_missing(&e) => {
                let parent = directory
                    .parent()
                    .ok_or_else(|| anyhow!("cannot create remote root directory"))?;
                self.makedirs(parent)?;
                self.sftp
                    .mkdir(directory, 0o755)
                    .map_err(ctx!("creating remote {directory:?}"))?;
                Ok(())
            }
            // mkdir on an existing directory reports failure; treat
            // the path as usable when stat confirms it
            Err(e) => {
                if self.sftp.stat(directory).is_ok() {
                    Ok(())
                } else {
                    Err(anyhow!("creating remote {directory:?}: {e}").into())
                }
            }
        }
    }

    fn send_file(
        &self,
        local: &Path,
        remote: &Path,
        replace: bool,
        delete: bool,
    ) -> Result<(), RemoteError> {
        let metadata = std::fs::metadata(local).map_err(ctx!("reading {local:?}"))?;

        if !replace {
            if let Ok(stat) = self.sftp.stat(remote) {
                let local_mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs());
                if let (Some(local_mtime), Some(remote_mtime)) = (local_mtime, stat.mtime) {
                    if local_mtime <= remote_mtime {
                        return Ok(());
                    }
                }
            }
        }

        let contents = std::fs::read(local).map_err(ctx!("reading {local:?}"))?;
        let mut file = match self.sftp.create(remote) {
            Ok(file) => file,
            Err(e) if is_missing(&e) => {
                if let Some(parent) = remote.parent() {
                    self.makedirs(parent)?;
                }
                self.sftp
                    .create(remote)
                    .map_err(ctx!("creating remote {remote:?}"))?
            }
            Err(e) => return Err(anyhow!("creating remote {remote:?}: {e}").into()),
        };
        file.write_all(&contents)
            .map_err(ctx!("writing remote {remote:?}"))?;
        drop(file);

        use std::os::unix::fs::PermissionsExt;
        self.sftp
            .setstat(remote, mode_only(metadata.permissions().mode()))
            .map_err(ctx!("setting mode of remote {remote:?}"))?;

        if delete {
            std::fs::remove_file(local).map_err(ctx!("removing {local:?}"))?;
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
            for entry in std::fs::read_dir(local).map_err(ctx!("reading {local:?}"))? {
                let entry = entry.map_err(ctx!("reading an entry of {local:?}"))?;
                self.send_resolved(
                    &entry.path(),
                    &remote.join(entry.file_name()),
                    replace,
                    delete,
                )?;
            }
            if delete {
                std::fs::remove_dir(local).map_err(ctx!("removing {local:?}"))?;
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

    fn stat_or_missing(&self, path: &Path) -> Result<FileStat, RemoteError> {
        self.sftp.stat(path).map_err(|e| {
            if is_missing(&e) {
                RemoteError::RemotePathNotFound(path.to_owned())
            } else {
                anyhow!("stat of remote {path:?}: {e}").into()
            }
        })
    }

    fn receive_resolved(
        &self,
        remote: &Path,
        local: &Path,
        delete: bool,
    ) -> Result<(), RemoteError> {
        let stat = self.stat_or_missing(remote)?;
        if stat.is_dir() {
            std::fs::create_dir_all(local).map_err(ctx!("creating {local:?}"))?;
            if let Some(perm) = stat.perm {
                crate::io_util::set_mode_bits(local, perm & 0o777)?;
            }
            for (path, _) in self
                .sftp
                .readdir(remote)
                .map_err(ctx!("listing remote {remote:?}"))?
            {
                let name = path
                    .file_name()
                    .ok_or_else(|| anyhow!("remote entry without a name: {path:?}"))?
                    .to_owned();
                self.receive_resolved(&path, &local.join(name), delete)?;
            }
            if delete {
                self.sftp
                    .rmdir(remote)
                    .map_err(ctx!("removing remote {remote:?}"))?;
            }
        } else {
            if let Some(parent) = local.parent() {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    std::fs::create_dir_all(parent).map_err(ctx!("creating {parent:?}"))?;
                }
            }
            let mut file = self
                .sftp
                .open(remote)
                .map_err(ctx!("opening remote {remote:?}"))?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .map_err(ctx!("reading remote {remote:?}"))?;
            drop(file);
            std::fs::write(local, contents).map_err(ctx!("writing {local:?}"))?;
            if let Some(perm) = stat.perm {
                crate::io_util::set_mode_bits(local, perm & 0o777)?;
            }
            if delete {
                self.sftp
                    .unlink(remote)
                    .map_err(ctx!("removing remote {remote:?}"))?;
            }
        }
        Ok(())
    }

    pub fn receive(&mut self, remote: &Path, local: &Path, delete: bool) -> Result<(), RemoteError> {
        self.receive_resolved(&self.resolve(remote), local, delete)
    }

    fn delete_resolved(&self, path: &Path) -> Result<(), RemoteError> {
        let stat = self.stat_or_missing(path)?;
        if stat.is_dir() {
            for (entry, _) in self
                .sftp
                .readdir(path)
                .map_err(ctx!("listing remote {path:?}"))?
            {
                self.delete_resolved(&entry)?;
            }
            self.sftp
                .rmdir(path)
                .map_err(ctx!("removing remote {path:?}"))?;
        } else {
            self.sftp
                .unlink(path)
                .map_err(ctx!("removing remote {path:?}"))?;
        }
        Ok(())
    }

    pub fn delete_remote(&mut self, path: &Path) -> Result<(), RemoteError> {
        self.delete_resolved(&self.resolve(path))
    }

    pub fn get_file_contents(&mut self, path: &Path) -> Result<String, RemoteError> {
        let path = self.resolve(path);
        let mut file = self.sftp.open(&path).map_err(|e| {
            if is_missing(&e) {
                RemoteError::RemotePathNotFound(path.clone())
            } else {
                anyhow::Error::from(e)
                    .context(format!("opening remote {path:?}"))
                    .into()
            }
        })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(ctx!("reading remote {path:?}"))?;
        Ok(contents)
    }

    pub fn put_file_contents(&mut self, path: &Path, text: &str) -> Result<(), RemoteError> {
        let path = self.resolve(path);
        let mut file = match self.sftp.create(&path) {
            Ok(file) => file,
            Err(e) if is_missing(&e) => {
                if let Some(parent) = path.parent() {
                    self.makedirs(parent)?;
                }
                self.sftp
                    .create(&path)
                    .map_err(ctx!("creating remote {path:?}"))?
            }
            Err(e) => return Err(anyhow!("creating remote {path:?}: {e}").into()),
        };
        file.write_all(text.as_bytes())
            .map_err(ctx!("writing remote {path:?}"))?;
        Ok(())
    }

    /// Run a command on the remote host, in the working directory
    /// when one is configured. Returns the captured stdout.
    pub fn execute(&mut self, cmd: &str) -> Result<String, RemoteError> {
        let cmd = match &self.working_directory {
            Some(wd) => format!("cd {:?} && {}", wd.display(), cmd),
            None => cmd.to_owned(),
        };
        let mut channel = self
            .session
            .channel_session()
            .map_err(ctx!("opening an exec channel"))?;
        channel.exec(&cmd).map_err(ctx!("running {cmd:?}"))?;
        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(ctx!("reading the output of {cmd:?}"))?;
        channel.wait_close().map_err(ctx!("closing the channel"))?;
        Ok(stdout)
    }
}
