use crate::error::{Result, SyncError};
use crate::history::FileReference;
use crate::path::RelativePath;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Added,
    Deleted,
    Modified,
}

impl ChangeType {
    /// Kind of change that turns `from` into `to`, if any
    pub fn between<T>(from: &Option<T>, to: &Option<T>) -> Option<ChangeType> {
        match (from, to) {
            (None, Some(_)) => Some(ChangeType::Added),
            (Some(_), None) => Some(ChangeType::Deleted),
            (Some(_), Some(_)) => Some(ChangeType::Modified),
            (None, None) => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Added => write!(f, "added"),
            ChangeType::Deleted => write!(f, "deleted"),
            ChangeType::Modified => write!(f, "modified"),
        }
    }
}

/// One event on one path between two consecutive snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawChange", rename_all = "camelCase")]
pub struct Change {
    #[serde(rename = "type")]
    change_type: ChangeType,
    from_file: Option<FileReference>,
    to_file: Option<FileReference>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChange {
    #[serde(rename = "type")]
    change_type: ChangeType,
    from_file: Option<FileReference>,
    to_file: Option<FileReference>,
}

impl TryFrom<RawChange> for Change {
    type Error = SyncError;

    fn try_from(raw: RawChange) -> Result<Self> {
        Change::new(raw.change_type, raw.from_file, raw.to_file)
    }
}

impl Change {
    pub fn new(
        change_type: ChangeType,
        from_file: Option<FileReference>,
        to_file: Option<FileReference>,
    ) -> Result<Self> {
        match (change_type, &from_file, &to_file) {
            (ChangeType::Added, None, Some(_)) | (ChangeType::Deleted, Some(_), None) => {}
            (ChangeType::Modified, Some(from), Some(to)) => {
                if from.path != to.path {
                    return Err(SyncError::InvalidChange(format!(
                        "modified change between different paths {} and {}",
                        from.path, to.path
                    )));
                }
            }
            (change_type, from, to) => {
                return Err(SyncError::InvalidChange(format!(
                    "{} change with{} source and{} target",
                    change_type,
                    if from.is_some() { "" } else { "out" },
                    if to.is_some() { "" } else { "out" },
                )))
            }
        }

        Ok(Self {
            change_type,
            from_file,
            to_file,
        })
    }

    pub fn added(file: FileReference) -> Self {
        Self {
            change_type: ChangeType::Added,
            from_file: None,
            to_file: Some(file),
        }
    }

    pub fn deleted(file: FileReference) -> Self {
        Self {
            change_type: ChangeType::Deleted,
            from_file: Some(file),
            to_file: None,
        }
    }

    pub fn modified(from: FileReference, to: FileReference) -> Result<Self> {
        Self::new(ChangeType::Modified, Some(from), Some(to))
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn from_file(&self) -> Option<&FileReference> {
        self.from_file.as_ref()
    }

    pub fn to_file(&self) -> Option<&FileReference> {
        self.to_file.as_ref()
    }

    /// Path the change applies to (the target's spelling when both exist)
    pub fn path(&self) -> &RelativePath {
        match (&self.to_file, &self.from_file) {
            (Some(file), _) | (None, Some(file)) => &file.path,
            // Construction guarantees at least one side
            (None, None) => unreachable!("change without files"),
        }
    }
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.change_type, self.path())
    }
}

/// Changes of a single path, oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeList {
    path: RelativePath,
    changes: Vec<Change>,
}

impl ChangeList {
    pub fn new(changes: Vec<Change>) -> Result<Self> {
        let path = match changes.first() {
            Some(first) => first.path().clone(),
            None => {
                return Err(SyncError::InvalidChangeList(
                    "a change list needs at least one change".to_string(),
                ))
            }
        };

        if let Some(other) = changes.iter().find(|c| c.path() != &path) {
            return Err(SyncError::InvalidChangeList(format!(
                "changes for {} and {} in one list",
                path,
                other.path()
            )));
        }

        Ok(Self { path, changes })
    }

    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn first(&self) -> &Change {
        &self.changes[0]
    }

    pub fn last(&self) -> &Change {
        &self.changes[self.changes.len() - 1]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }
}

impl<'a> IntoIterator for &'a ChangeList {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
