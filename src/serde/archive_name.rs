use std::{fmt::Display, str::FromStr};

use serde::de::Visitor;

/// The identity of a simulation: 22 characters of URL-safe base64
/// (an unpadded MD5 digest), usable directly as a file name stem.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct ArchiveName(String);

pub const ARCHIVE_NAME_LEN: usize = 22;

impl ArchiveName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The catalog file name for this simulation.
    pub fn archive_filename(&self) -> String {
        format!("{}.tar.bz2", self.0)
    }

    /// Only for callers that produced the characters themselves (see
    /// `identity::archive_name`).
    pub(crate) fn from_encoded(s: String) -> Self {
        debug_assert!(s.len() == ARCHIVE_NAME_LEN);
        ArchiveName(s)
    }
}

impl AsRef<str> for ArchiveName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Display for ArchiveName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const ERR_MSG: &str =
    "22 characters out of [A-Za-z0-9_-] (an unpadded URL-safe base64 MD5 digest)";

impl FromStr for ArchiveName {
    type Err = &'static str;

    fn from_str(v: &str) -> Result<Self, Self::Err> {
        if v.len() != ARCHIVE_NAME_LEN
            || !v
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ERR_MSG);
        }
        Ok(ArchiveName(v.to_owned()))
    }
}

struct ArchiveNameVisitor;
impl<'de> Visitor<'de> for ArchiveNameVisitor {
    type Value = ArchiveName;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str(ERR_MSG)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> serde::Deserialize<'de> for ArchiveName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ArchiveNameVisitor)
    }
}

impl serde::Serialize for ArchiveName {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_parse() {
        assert!("kK7uz3BWda3Pp8X1bdnYpg".parse::<ArchiveName>().is_ok());
        assert!("too-short".parse::<ArchiveName>().is_err());
        assert!("kK7uz3BWda3Pp8X1bdnYp=".parse::<ArchiveName>().is_err());
    }

    #[test]
    fn t_archive_filename() {
        let n: ArchiveName = "kK7uz3BWda3Pp8X1bdnYpg".parse().unwrap();
        assert_eq!(n.archive_filename(), "kK7uz3BWda3Pp8X1bdnYpg.tar.bz2");
    }
}
