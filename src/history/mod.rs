// Folder histories
//
// Every synchronized folder owns one branch (`history/<name>`) in the shared
// repository. Each commit on it is a snapshot: a tree mirroring the folder
// layout where every file is a small JSON blob holding its length and
// modification time. File contents are never stored.

pub mod scanner;
pub mod sets;
pub mod store;
pub mod tree;

pub use scanner::Scanner;
pub use sets::{SnapshotSet, SnapshotSetId, SnapshotSetStore};
pub use store::HistoryStore;
pub use tree::{DirectoryNode, Entry, FileEntry, SnapshotTree};

use crate::path::RelativePath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a file version: path, modification time and length
///
/// Two references match iff all three are equal (the path ignoring case).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReference {
    pub path: RelativePath,
    pub last_write_time: DateTime<Utc>,
    pub length: u64,
}

impl FileReference {
    pub fn new(path: RelativePath, last_write_time: DateTime<Utc>, length: u64) -> Self {
        Self {
            path,
            last_write_time,
            length,
        }
    }

    pub fn matches(&self, other: &FileReference) -> bool {
        self == other
    }
}

impl std::fmt::Display for FileReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bytes, {})",
            self.path,
            self.length,
            self.last_write_time.to_rfc3339()
        )
    }
}

/// Blob stored in a snapshot tree for every file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileProperties {
    pub last_write_time: DateTime<Utc>,
    pub length: u64,
}

impl From<&FileReference> for FileProperties {
    fn from(file: &FileReference) -> Self {
        Self {
            last_write_time: file.last_write_time,
            length: file.length,
        }
    }
}

/// Commit id of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn oid(&self) -> Option<git2::Oid> {
        git2::Oid::from_str(&self.0).ok()
    }
}

impl From<git2::Oid> for SnapshotId {
    fn from(oid: git2::Oid) -> Self {
        Self(oid.to_string())
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable recorded state of one folder
#[derive(Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub history: String,
    pub created: DateTime<Utc>,
    pub root: SnapshotTree,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("history", &self.history)
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_reference_matches_ignoring_path_case() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let a = FileReference::new(RelativePath::parse("Docs/A.txt").unwrap(), time, 10);
        let b = FileReference::new(RelativePath::parse("docs/a.txt").unwrap(), time, 10);
        let c = FileReference::new(RelativePath::parse("docs/a.txt").unwrap(), time, 11);
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_file_properties_json() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let props = FileProperties {
            last_write_time: time,
            length: 42,
        };
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("\"lastWriteTime\""));
        assert!(json.contains("\"length\":42"));
    }
}
