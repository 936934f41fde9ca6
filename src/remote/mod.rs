//! Transport to the compute host's folder.
//!
//! `send` and `receive` handle files and directories recursively,
//! copying the lowest 9 mode bits; `send` in non-replace mode skips
//! files whose destination is at least as recent. When the `folder`
//! sub-config has no `host`, a local-filesystem backend with
//! identical semantics is used. The connection is opened lazily on
//! first use.

pub mod local;
pub mod sftp;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::folder::Folder;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("remote path {0:?} not found")]
    RemotePathNotFound(PathBuf),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The `folder` sub-config.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RemoteFolderConfig {
    /// No host means the "remote" folder lives on this machine.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Relative remote paths are resolved against this directory.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

pub(crate) enum Connection {
    Local(local::LocalFolder),
    Sftp(sftp::SftpFolder),
}

macro_rules! delegate {
    ($connection:expr, $method:ident ( $($arg:expr),* )) => {
        match $connection {
            Connection::Local(c) => c.$method($($arg),*),
            Connection::Sftp(c) => c.$method($($arg),*),
        }
    };
}

pub struct RemoteFolder {
    config: RemoteFolderConfig,
    connection: Option<Connection>,
}

fn basename(path: &Path) -> PathBuf {
    PathBuf::from(path.file_name().unwrap_or(path.as_os_str()))
}

impl RemoteFolder {
    pub fn new(config: RemoteFolderConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    /// Build from the folder's `folder` sub-config; an absent
    /// sub-config means local transport.
    pub fn from_folder(folder: &Folder, config_name: Option<&str>) -> Result<Self> {
        let config = match folder.config("folder", config_name)? {
            Some(map) => {
                serde_json::from_value(serde_json::Value::Object(map.as_ref().clone()))?
            }
            None => RemoteFolderConfig::default(),
        };
        Ok(Self::new(config))
    }

    pub fn is_local(&self) -> bool {
        self.config.host.is_none()
    }

    /// Open the connection now instead of on first use.
    pub fn open(&mut self) -> Result<(), RemoteError> {
        self.connection()?;
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut Connection, RemoteError> {
        if self.connection.is_none() {
            let connection = if self.config.host.is_some() {
                Connection::Sftp(sftp::SftpFolder::connect(&self.config)?)
            } else {
                Connection::Local(local::LocalFolder::new(&self.config))
            };
            self.connection = Some(connection);
        }
        Ok(self.connection.as_mut().expect("just opened above"))
    }

    pub fn close(&mut self) {
        self.connection = None;
    }

    /// Send a file or directory; returns the remote path (the
    /// source's base name when `dest` is not given).
    pub fn send(
        &mut self,
        path: &Path,
        dest: Option<&Path>,
        replace: bool,
        delete: bool,
    ) -> Result<PathBuf, RemoteError> {
        let remote_path = dest.map(Path::to_path_buf).unwrap_or_else(|| basename(path));
        delegate!(self.connection()?, send(path, &remote_path, replace, delete))?;
        Ok(remote_path)
    }

    /// Receive a remote file or directory; returns the local path.
    pub fn receive(
        &mut self,
        path: &Path,
        dest: Option<&Path>,
        delete: bool,
    ) -> Result<PathBuf, RemoteError> {
        let local_path = dest.map(Path::to_path_buf).unwrap_or_else(|| basename(path));
        delegate!(self.connection()?, receive(path, &local_path, delete))?;
        Ok(local_path)
    }

    /// Recursively delete remote files or directories.
    pub fn delete_remote(&mut self, paths: &[PathBuf]) -> Result<(), RemoteError> {
        for path in paths {
            delegate!(self.connection()?, delete_remote(path))?;
        }
        Ok(())
    }

    pub fn get_file_contents(&mut self, path: &Path) -> Result<String, RemoteError> {
        delegate!(self.connection()?, get_file_contents(path))
    }

    pub fn put_file_contents(&mut self, path: &Path, text: &str) -> Result<(), RemoteError> {
        delegate!(self.connection()?, put_file_contents(path, text))
    }

    /// Run a command on the remote host; returns its captured stdout.
    pub fn execute(&mut self, cmd: &str) -> Result<String, RemoteError> {
        delegate!(self.connection()?, execute(cmd))
    }
}
