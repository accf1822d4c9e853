use crate::error::{Result, SyncError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Root-relative path of a file inside a synchronized folder
///
/// Separators are normalized to `/` and leading separators are dropped, so
/// `\docs\a.txt`, `/docs/a.txt` and `docs/a.txt` are the same path.
/// Equality, ordering and hashing ignore case; the original spelling is kept
/// for display and for writing snapshot trees.
#[derive(Debug, Clone)]
pub struct RelativePath {
    display: String,
    key: String,
}

impl RelativePath {
    /// Parse and normalize a relative path
    ///
    /// Fails on empty paths and on `.` or `..` components.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in s.split(['/', '\\']) {
            match segment {
                "" => continue,
                "." | ".." => {
                    return Err(SyncError::InvalidPath {
                        path: PathBuf::from(s),
                    })
                }
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(SyncError::InvalidPath {
                path: PathBuf::from(s),
            });
        }

        let display = segments.join("/");
        let key = display.to_lowercase();
        Ok(Self { display, key })
    }

    /// Build from a filesystem path relative to a folder root
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = path.to_str().ok_or_else(|| SyncError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        Self::parse(s)
    }

    /// Append a single name component
    pub fn join(&self, name: &str) -> Result<Self> {
        Self::parse(&format!("{}/{}", self.display, name))
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Lowercased form used for comparisons and as a storage key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last component
    pub fn name(&self) -> &str {
        self.display.rsplit('/').next().unwrap_or(&self.display)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.display.split('/')
    }

    /// True if `self` equals `prefix` or lies below it
    pub fn starts_with(&self, prefix: &RelativePath) -> bool {
        self.key == prefix.key
            || (self.key.starts_with(&prefix.key)
                && self.key.as_bytes().get(prefix.key.len()) == Some(&b'/'))
    }
}

impl PartialEq for RelativePath {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RelativePath {}

impl Hash for RelativePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for RelativePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RelativePath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

impl std::str::FromStr for RelativePath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for RelativePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_normalizes_separators() {
        let path = RelativePath::parse("\\docs\\sub/file.txt").unwrap();
        assert_eq!(path.as_str(), "docs/sub/file.txt");
        assert_eq!(path.name(), "file.txt");
    }

    #[test]
    fn test_leading_slash_dropped() {
        let a = RelativePath::parse("/path1").unwrap();
        let b = RelativePath::parse("path1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "path1");
    }

    #[test]
    fn test_case_insensitive_equality() {
        let a = RelativePath::parse("/path1").unwrap();
        let b = RelativePath::parse("/pATh1").unwrap();
        assert_eq!(a, b);
        assert_eq!(b.as_str(), "pATh1");

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_rejects_empty_and_dot_segments() {
        assert!(RelativePath::parse("").is_err());
        assert!(RelativePath::parse("///").is_err());
        assert!(RelativePath::parse("a/../b").is_err());
        assert!(RelativePath::parse("./a").is_err());
    }

    #[test]
    fn test_starts_with() {
        let dir = RelativePath::parse("Docs").unwrap();
        assert!(RelativePath::parse("docs/a.txt").unwrap().starts_with(&dir));
        assert!(RelativePath::parse("DOCS").unwrap().starts_with(&dir));
        assert!(!RelativePath::parse("docs2/a.txt").unwrap().starts_with(&dir));
    }

    #[test]
    fn test_serde_as_string() {
        let path = RelativePath::parse("a/B.txt").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"a/B.txt\"");
        let back: RelativePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_str(), "a/B.txt");
    }
}
