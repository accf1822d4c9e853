use super::items::{Item, ItemStore};
use crate::diff::Equivalence;
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use crate::graph::{ChangeGraph, NodeId};
use crate::history::{FileReference, SnapshotSetId};
use crate::path::RelativePath;
use serde::{Deserialize, Serialize};

/// Concurrent versions of one path that cannot be ordered
#[derive(Debug, Clone, PartialEq)]
pub struct MultiVersionConflict {
    path: RelativePath,
    // None stands for "deleted"
    versions: Vec<Option<FileReference>>,
}

impl MultiVersionConflict {
    pub fn new(path: RelativePath, versions: Vec<Option<FileReference>>) -> Result<Self> {
        if versions.len() < 2 {
            return Err(SyncError::InvalidConflict(format!(
                "{} needs at least 2 versions, got {}",
                path,
                versions.len()
            )));
        }
        Ok(Self { path, versions })
    }

    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    pub fn versions(&self) -> &[Option<FileReference>] {
        &self.versions
    }

    /// Versions that are files rather than deletions
    pub fn files(&self) -> impl Iterator<Item = &FileReference> {
        self.versions.iter().flatten()
    }
}

/// Stored marker for a path in conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub file_path: RelativePath,
    /// Snapshot set the conflict was detected in
    pub snapshot_id: SnapshotSetId,
}

impl Item for ConflictInfo {
    type Key = RelativePath;
    const KIND: &'static str = "conflicts";

    fn key(&self) -> RelativePath {
        self.file_path.clone()
    }
}

/// Unresolved conflicts keyed by path (case-insensitive)
pub struct ConflictStore<'a> {
    items: ItemStore<'a, ConflictInfo>,
}

impl<'a> ConflictStore<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            items: ItemStore::new(tx),
        }
    }

    pub fn items(&self) -> Result<Vec<ConflictInfo>> {
        self.items.items()
    }

    pub fn get(&self, path: &RelativePath) -> Result<ConflictInfo> {
        self.items.get(path)
    }

    pub fn contains(&self, path: &RelativePath) -> Result<bool> {
        self.items.contains(path)
    }

    pub fn add_items(&self, conflicts: Vec<ConflictInfo>) -> Result<()> {
        self.items.add_items(conflicts)
    }

    pub fn update_items(&self, conflicts: Vec<ConflictInfo>) -> Result<()> {
        self.items.update_items(conflicts)
    }

    pub fn remove_items(&self, paths: &[RelativePath]) -> Result<()> {
        self.items.remove_items(paths)
    }
}

/// Finds paths whose replicas hold versions the graph cannot order
pub struct ConflictDetector;

impl ConflictDetector {
    /// `latest` holds the newest node of every replica taking part
    ///
    /// Among the leading nodes (those not superseded by another replica)
    /// every distinct value is a competing version.
    pub fn detect<E>(
        graph: &ChangeGraph<Option<FileReference>, E>,
        path: &RelativePath,
        latest: &[NodeId],
    ) -> Result<Option<MultiVersionConflict>>
    where
        E: Equivalence<Option<FileReference>>,
    {
        let distinct = Self::distinct_leading(graph, latest);
        if distinct.len() < 2 {
            return Ok(None);
        }

        let versions = distinct
            .into_iter()
            .map(|node| graph.value(node).cloned().flatten())
            .collect();
        tracing::debug!("Conflict detected for {}", path);
        MultiVersionConflict::new(path.clone(), versions).map(Some)
    }

    /// Leading nodes with one representative per distinct value
    pub fn distinct_leading<E>(
        graph: &ChangeGraph<Option<FileReference>, E>,
        latest: &[NodeId],
    ) -> Vec<NodeId>
    where
        E: Equivalence<Option<FileReference>>,
    {
        let mut distinct: Vec<NodeId> = Vec::new();
        for node in graph.leading(latest) {
            if !distinct.iter().any(|seen| graph.same_value(*seen, node)) {
                distinct.push(node);
            }
        }
        distinct
    }
}
