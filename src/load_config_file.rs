//! Generic config file loader.
//!
//! The `.hateno` files are plain JSON, but they are parsed through
//! `json5` so hand-edited configs may carry comments or trailing
//! commas without breaking anything.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;

/// json5 0.4 reports the error location but does not display it; pull
/// it out through the one pattern the crate exposes.
#[derive(Debug, thiserror::Error)]
pub struct ConfigParseError(json5::Error);

impl Display for ConfigParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json5::Error::Message { msg, location } = &self.0;
        if let Some(json5::Location { line, column }) = location {
            write!(f, "{msg} at line:column {line}:{column}")
        } else {
            write!(f, "{msg}")
        }
    }
}

pub fn config_from_str<T: DeserializeOwned>(s: &str) -> Result<T, ConfigParseError> {
    json5::from_str(s).map_err(ConfigParseError)
}

/// Returns `None` if the file does not exist
pub fn try_load_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(config_from_str(&s).map_err(|e| {
            anyhow!("decoding JSON from config file {path:?}: {e}")
        })?)),
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => Ok(None),
            _ => bail!("loading config file from {path:?}: {e}"),
        },
    }
}

pub trait LoadConfigFile: DeserializeOwned {
    /// The location checked when no explicit path is given.
    fn default_config_path() -> Result<Option<PathBuf>>;

    /// If `path` is given, the file must exist or an error is
    /// returned. Otherwise, the default location is checked and if a
    /// file exists there, it is loaded; otherwise `or_else` is called
    /// with a message mentioning what was tried; it can issue an
    /// error or generate a default config value.
    fn load_config<P: AsRef<Path>>(
        path: Option<P>,
        or_else: impl FnOnce(String) -> Result<Self>,
    ) -> Result<Self> {
        if let Some(path) = path {
            let path = path.as_ref();
            try_load_json_file(path)?
                .ok_or_else(|| anyhow!("file with specified location {path:?} does not exist"))
        } else {
            if let Some(path) = Self::default_config_path()? {
                if let Some(c) = try_load_json_file(&path)? {
                    return Ok(c);
                }
                or_else(format!("tried the default path: {path:?}"))
            } else {
                or_else(
                    "no path was given and there is no default \
                     config location for this type"
                        .into(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct Conf {
        exec: String,
        n: u32,
    }

    #[test]
    fn t_plain_json_and_json5() {
        let c: Conf = config_from_str(r#"{"exec": "./run", "n": 3}"#).unwrap();
        assert_eq!(
            c,
            Conf {
                exec: "./run".into(),
                n: 3
            }
        );
        // json5 extensions stay acceptable
        let c: Conf = config_from_str("{exec: './run', n: 3, /* note */}").unwrap();
        assert_eq!(c.n, 3);
    }

    #[test]
    fn t_missing_file_is_none() {
        let r: Option<Conf> =
            try_load_json_file(Path::new("/nonexistent/definitely/not.json")).unwrap();
        assert_eq!(r, None);
    }
}
