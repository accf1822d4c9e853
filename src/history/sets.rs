use super::SnapshotId;
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use chrono::{DateTime, Utc};
use git2::{ObjectType, Oid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BRANCH: &str = "multi-history";
const FILE_NAME: &str = "snapshots.json";

/// Commit id of a snapshot set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotSetId(String);

impl SnapshotSetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnapshotSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest snapshot of every folder at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSet {
    pub id: SnapshotSetId,
    pub created: DateTime<Utc>,
    pub snapshots: BTreeMap<String, SnapshotId>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotSetDocument {
    snapshots: BTreeMap<String, SnapshotId>,
}

/// Multi-folder history stored on its own branch
pub struct SnapshotSetStore<'a> {
    tx: &'a Transaction,
}

impl<'a> SnapshotSetStore<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self { tx }
    }

    /// Record a new snapshot set
    pub fn record(&self, snapshots: BTreeMap<String, SnapshotId>) -> Result<SnapshotSet> {
        let repo = self.tx.repository()?;
        let document = SnapshotSetDocument { snapshots };
        let blob = repo.blob(&serde_json::to_vec_pretty(&document)?)?;
        let mut builder = repo.treebuilder(None)?;
        builder.insert(FILE_NAME, blob, 0o100644)?;
        let tree = builder.write()?;

        let oid = self.tx.commit_tree(
            BRANCH,
            tree,
            &format!("Snapshot set of {} folder(s)", document.snapshots.len()),
        )?;
        tracing::debug!("Recorded snapshot set {}", oid);
        self.load(oid)
    }

    pub fn latest(&self) -> Result<Option<SnapshotSet>> {
        match self.tx.branch_tip(BRANCH)? {
            Some(oid) => self.load(oid).map(Some),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &SnapshotSetId) -> Result<SnapshotSet> {
        let not_found = || SyncError::SnapshotSetNotFound { id: id.to_string() };
        let oid = Oid::from_str(id.as_str()).map_err(|_| not_found())?;
        let tip = self.tx.branch_tip(BRANCH)?.ok_or_else(not_found)?;

        let repo = self.tx.repository()?;
        if repo.find_commit(oid).is_err() {
            return Err(not_found());
        }
        if oid != tip && !repo.graph_descendant_of(tip, oid)? {
            return Err(not_found());
        }
        self.load(oid)
    }

    fn load(&self, oid: Oid) -> Result<SnapshotSet> {
        let repo = self.tx.repository()?;
        let commit = repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let entry = tree
            .get_name(FILE_NAME)
            .ok_or_else(|| SyncError::SnapshotSetNotFound { id: oid.to_string() })?;
        let blob = repo
            .find_object(entry.id(), Some(ObjectType::Blob))?
            .peel_to_blob()?;
        let document: SnapshotSetDocument = serde_json::from_slice(blob.content())?;

        Ok(SnapshotSet {
            id: SnapshotSetId::new(oid.to_string()),
            created: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
            snapshots: document.snapshots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use tempfile::TempDir;

    fn active_tx(temp: &TempDir) -> Transaction {
        let remote = temp.path().join("remote.git");
        Repository::init_bare(&remote).unwrap();
        let mut tx = Transaction::new(remote.to_str().unwrap(), temp.path().join("local"));
        tx.begin().unwrap();
        tx
    }

    #[test]
    fn test_empty_store_has_no_latest() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        assert!(SnapshotSetStore::new(&tx).latest().unwrap().is_none());
    }

    #[test]
    fn test_record_and_get() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = SnapshotSetStore::new(&tx);

        let mut snapshots = BTreeMap::new();
        snapshots.insert("docs".to_string(), SnapshotId::new("a".repeat(40)));
        let first = store.record(snapshots.clone()).unwrap();

        snapshots.insert("music".to_string(), SnapshotId::new("b".repeat(40)));
        let second = store.record(snapshots).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().id, second.id);
        let loaded = store.get(&first.id).unwrap();
        assert_eq!(loaded.snapshots.len(), 1);
        assert_eq!(store.get(&second.id).unwrap().snapshots.len(), 2);
    }

    #[test]
    fn test_get_unknown_fails() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = SnapshotSetStore::new(&tx);
        store.record(BTreeMap::new()).unwrap();

        assert!(matches!(
            store.get(&SnapshotSetId::new("nope")),
            Err(SyncError::SnapshotSetNotFound { .. })
        ));
        assert!(matches!(
            store.get(&SnapshotSetId::new("c".repeat(40))),
            Err(SyncError::SnapshotSetNotFound { .. })
        ));
    }
}
