use super::scanner::Scanner;
use super::tree::{SnapshotTree, TreeReader};
use super::{FileProperties, FileReference, Snapshot, SnapshotId};
use crate::diff::{self, ChangeList, Equivalence};
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use chrono::{DateTime, Utc};
use git2::{Oid, Repository};
use once_cell::unsync::OnceCell;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const BRANCH_PREFIX: &str = "history/";

/// Append-only snapshot histories, one branch per folder
pub struct HistoryStore<'a> {
    tx: &'a Transaction,
    reader: OnceCell<Arc<TreeReader>>,
}

impl<'a> HistoryStore<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            tx,
            reader: OnceCell::new(),
        }
    }

    fn branch(name: &str) -> String {
        format!("{}{}", BRANCH_PREFIX, name)
    }

    fn reader(&self) -> Result<Arc<TreeReader>> {
        self.tx.ensure_active()?;
        self.reader
            .get_or_try_init(|| TreeReader::open(self.tx.local_path()))
            .map(Arc::clone)
    }

    /// Names of all histories
    pub fn histories(&self) -> Result<Vec<String>> {
        Ok(self
            .tx
            .branches_with_prefix(BRANCH_PREFIX)?
            .into_iter()
            .filter_map(|b| b.strip_prefix(BRANCH_PREFIX).map(str::to_string))
            .collect())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.tx.branch_tip(&Self::branch(name))?.is_some())
    }

    /// Start a new history whose first snapshot is empty
    pub fn create_history(&self, name: &str) -> Result<Snapshot> {
        let branch = Self::branch(name);
        if name.is_empty()
            || name.contains('/')
            || !git2::Reference::is_valid_name(&format!("refs/heads/{}", branch))
        {
            return Err(SyncError::InvalidName {
                name: name.to_string(),
            });
        }
        if self.exists(name)? {
            return Err(SyncError::DuplicateHistory {
                name: name.to_string(),
            });
        }

        let repo = self.tx.repository()?;
        let tree = repo.treebuilder(None)?.write()?;
        let oid = self
            .tx
            .commit_tree(&branch, tree, &format!("Create history {}", name))?;
        tracing::info!("Created history {}", name);
        self.snapshot(name, oid)
    }

    /// Stop tracking a folder; its snapshots stay reachable from snapshot sets
    pub fn remove_history(&self, name: &str) -> Result<()> {
        if !self.exists(name)? {
            return Err(SyncError::HistoryNotFound {
                name: name.to_string(),
            });
        }
        self.tx.delete_branch(&Self::branch(name))?;
        tracing::info!("Removed history {}", name);
        Ok(())
    }

    /// Record a new snapshot containing exactly `files`
    pub fn append(
        &self,
        history: &str,
        files: impl IntoIterator<Item = FileReference>,
    ) -> Result<Snapshot> {
        if !self.exists(history)? {
            return Err(SyncError::HistoryNotFound {
                name: history.to_string(),
            });
        }

        let repo = self.tx.repository()?;
        let mut root = TreeNode::default();
        let mut count = 0usize;
        for file in files {
            root.insert(&file)?;
            count += 1;
        }
        let tree = root.write(repo)?;

        let oid = self.tx.commit_tree(
            &Self::branch(history),
            tree,
            &format!("Snapshot of {} ({} files)", history, count),
        )?;
        tracing::debug!("Appended snapshot {} to {}", oid, history);
        self.snapshot(history, oid)
    }

    /// Scan `root` and append a snapshot if anything changed
    pub fn record_folder(&self, history: &str, root: &Path) -> Result<Option<Snapshot>> {
        let files = Scanner::new(root).scan()?;
        let latest = self.latest_snapshot(history)?;

        let mut previous = latest.root.files()?;
        let mut current = files.clone();
        previous.sort_by(|a, b| a.path.cmp(&b.path));
        current.sort_by(|a, b| a.path.cmp(&b.path));
        if previous == current {
            tracing::info!("{} unchanged since snapshot {}", history, latest.id);
            return Ok(None);
        }

        self.append(history, files).map(Some)
    }

    pub fn latest_snapshot(&self, history: &str) -> Result<Snapshot> {
        match self.tx.branch_tip(&Self::branch(history))? {
            Some(oid) => self.snapshot(history, oid),
            None => Err(SyncError::HistoryNotFound {
                name: history.to_string(),
            }),
        }
    }

    /// Latest snapshot id of every history
    pub fn latest_ids(&self) -> Result<BTreeMap<String, SnapshotId>> {
        let mut ids = BTreeMap::new();
        for name in self.histories()? {
            if let Some(oid) = self.tx.branch_tip(&Self::branch(&name))? {
                ids.insert(name, SnapshotId::from(oid));
            }
        }
        Ok(ids)
    }

    pub fn get_snapshot(&self, history: &str, id: &SnapshotId) -> Result<Snapshot> {
        let tip = self
            .tx
            .branch_tip(&Self::branch(history))?
            .ok_or_else(|| SyncError::HistoryNotFound {
                name: history.to_string(),
            })?;

        let not_found = || SyncError::SnapshotNotFound {
            history: history.to_string(),
            id: id.to_string(),
        };
        let oid = id.oid().ok_or_else(not_found)?;

        let repo = self.tx.repository()?;
        if repo.find_commit(oid).is_err() {
            return Err(not_found());
        }
        if oid != tip && !repo.graph_descendant_of(tip, oid)? {
            return Err(not_found());
        }

        self.snapshot(history, oid)
    }

    /// All snapshots of a history, oldest first
    pub fn snapshots(&self, history: &str) -> Result<Vec<Snapshot>> {
        let latest = self.latest_snapshot(history)?;
        self.snapshots_between(history, None, &latest.id)
    }

    /// Snapshots from `from` (or the first snapshot) up to `to`, inclusive,
    /// oldest first
    pub fn snapshots_between(
        &self,
        history: &str,
        from: Option<&SnapshotId>,
        to: &SnapshotId,
    ) -> Result<Vec<Snapshot>> {
        let to_oid = self.snapshot_oid(history, to)?;
        let from_oid = match from {
            Some(id) => Some(self.snapshot_oid(history, id)?),
            None => None,
        };

        let repo = self.tx.repository()?;
        let mut chain = Vec::new();
        let mut current = repo.find_commit(to_oid)?;

        loop {
            let oid = current.id();
            chain.push(oid);
            if Some(oid) == from_oid {
                break;
            }
            let parent = current.parents().next();
            match parent {
                Some(parent) => current = parent,
                None => {
                    if let Some(from) = from {
                        return Err(SyncError::UnrelatedSnapshots {
                            history: history.to_string(),
                            from: from.to_string(),
                            to: to.to_string(),
                        });
                    }
                    break;
                }
            }
        }

        chain.reverse();
        chain
            .into_iter()
            .map(|oid| self.snapshot(history, oid))
            .collect()
    }

    /// Per-path changes between two snapshots of one history
    pub fn changes(
        &self,
        history: &str,
        from: Option<&SnapshotId>,
        to: &SnapshotId,
        equality: &dyn Equivalence<FileReference>,
    ) -> Result<Vec<ChangeList>> {
        let snapshots = self.snapshots_between(history, from, to)?;
        diff::compute_changes(&snapshots, equality)
    }

    /// Commit id of a snapshot known to belong to `history`
    fn snapshot_oid(&self, history: &str, id: &SnapshotId) -> Result<Oid> {
        let snapshot = self.get_snapshot(history, id)?;
        snapshot.id.oid().ok_or_else(|| SyncError::SnapshotNotFound {
            history: history.to_string(),
            id: id.to_string(),
        })
    }

    fn snapshot(&self, history: &str, oid: Oid) -> Result<Snapshot> {
        let repo = self.tx.repository()?;
        let commit = repo.find_commit(oid)?;
        let created = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default();
        Ok(Snapshot {
            id: SnapshotId::from(oid),
            history: history.to_string(),
            created,
            root: SnapshotTree::new(self.reader()?, commit.tree_id()),
        })
    }
}

/// In-memory directory used to build a snapshot tree bottom-up
#[derive(Default)]
struct TreeNode {
    // lowercased name -> (original name, child)
    children: BTreeMap<String, (String, TreeChild)>,
}

enum TreeChild {
    File(FileProperties),
    Directory(TreeNode),
}

impl TreeNode {
    fn insert(&mut self, file: &FileReference) -> Result<()> {
        let conflict = || SyncError::InvalidPath {
            path: file.path.as_str().into(),
        };

        let components: Vec<&str> = file.path.components().collect();
        let (last, parents) = components.split_last().ok_or_else(conflict)?;

        let mut node = self;
        for name in parents {
            let entry = node
                .children
                .entry(name.to_lowercase())
                .or_insert_with(|| (name.to_string(), TreeChild::Directory(TreeNode::default())));
            node = match &mut entry.1 {
                TreeChild::Directory(dir) => dir,
                TreeChild::File(_) => return Err(conflict()),
            };
        }

        if node.children.contains_key(&last.to_lowercase()) {
            return Err(conflict());
        }
        node.children.insert(
            last.to_lowercase(),
            (last.to_string(), TreeChild::File(FileProperties::from(file))),
        );
        Ok(())
    }

    fn write(&self, repo: &Repository) -> Result<Oid> {
        let mut builder = repo.treebuilder(None)?;

        for (name, child) in self.children.values() {
            match child {
                TreeChild::File(props) => {
                    let oid = repo.blob(&serde_json::to_vec(props)?)?;
                    builder.insert(name, oid, 0o100644)?;
                }
                TreeChild::Directory(dir) => {
                    let oid = dir.write(repo)?;
                    builder.insert(name, oid, 0o040000)?;
                }
            }
        }

        Ok(builder.write()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelativePath;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn active_tx(temp: &TempDir) -> Transaction {
        let remote = temp.path().join("remote.git");
        Repository::init_bare(&remote).unwrap();
        let mut tx = Transaction::new(remote.to_str().unwrap(), temp.path().join("local"));
        tx.begin().unwrap();
        tx
    }

    fn file(path: &str, length: u64) -> FileReference {
        FileReference::new(
            RelativePath::parse(path).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            length,
        )
    }

    #[test]
    fn test_create_history_starts_empty() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);

        let first = store.create_history("docs").unwrap();
        assert!(first.root.files().unwrap().is_empty());
        assert_eq!(store.histories().unwrap(), vec!["docs".to_string()]);
        assert_eq!(store.latest_snapshot("docs").unwrap().id, first.id);
    }

    #[test]
    fn test_create_duplicate_history_fails() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);

        store.create_history("docs").unwrap();
        assert!(matches!(
            store.create_history("docs"),
            Err(SyncError::DuplicateHistory { .. })
        ));
        assert!(matches!(
            store.create_history("a/b"),
            Err(SyncError::InvalidName { .. })
        ));
        assert!(matches!(
            store.create_history("bad..name"),
            Err(SyncError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_append_and_read_back() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        store.create_history("docs").unwrap();

        let snapshot = store
            .append("docs", vec![file("a.txt", 1), file("Sub/b.txt", 2)])
            .unwrap();

        let latest = store.latest_snapshot("docs").unwrap();
        assert_eq!(latest.id, snapshot.id);

        let b = latest
            .root
            .file(&RelativePath::parse("sub/B.txt").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(b.reference().unwrap(), &file("Sub/b.txt", 2));
    }

    #[test]
    fn test_append_rejects_colliding_paths() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        store.create_history("docs").unwrap();

        let result = store.append("docs", vec![file("a.txt", 1), file("A.TXT", 2)]);
        assert!(matches!(result, Err(SyncError::InvalidPath { .. })));

        let result = store.append("docs", vec![file("a", 1), file("a/b.txt", 2)]);
        assert!(matches!(result, Err(SyncError::InvalidPath { .. })));
    }

    #[test]
    fn test_missing_history_and_snapshot() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        let docs = store.create_history("docs").unwrap();
        let music = store.create_history("music").unwrap();

        assert!(matches!(
            store.latest_snapshot("videos"),
            Err(SyncError::HistoryNotFound { .. })
        ));
        assert!(matches!(
            store.append("videos", vec![]),
            Err(SyncError::HistoryNotFound { .. })
        ));
        assert!(matches!(
            store.get_snapshot("docs", &SnapshotId::new("not-a-commit")),
            Err(SyncError::SnapshotNotFound { .. })
        ));

        let music_next = store.append("music", vec![file("song.mp3", 5)]).unwrap();
        // A snapshot of another history does not belong to this one
        assert!(matches!(
            store.get_snapshot("docs", &music_next.id),
            Err(SyncError::SnapshotNotFound { .. })
        ));
        assert_eq!(store.get_snapshot("docs", &docs.id).unwrap().id, docs.id);
        assert_eq!(store.get_snapshot("music", &music.id).unwrap().id, music.id);
    }

    #[test]
    fn test_snapshots_between() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        let s0 = store.create_history("docs").unwrap();
        let s1 = store.append("docs", vec![file("a.txt", 1)]).unwrap();
        let s2 = store.append("docs", vec![file("a.txt", 2)]).unwrap();

        let all = store.snapshots("docs").unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![s0.id.clone(), s1.id.clone(), s2.id.clone()]);

        let window = store.snapshots_between("docs", Some(&s1.id), &s2.id).unwrap();
        let ids: Vec<_> = window.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![s1.id.clone(), s2.id.clone()]);

        assert!(matches!(
            store.snapshots_between("docs", Some(&s2.id), &s1.id),
            Err(SyncError::UnrelatedSnapshots { .. })
        ));
    }

    #[test]
    fn test_remove_history() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        store.create_history("docs").unwrap();
        store.create_history("music").unwrap();

        store.remove_history("docs").unwrap();
        assert_eq!(store.histories().unwrap(), vec!["music".to_string()]);
        assert!(matches!(
            store.remove_history("docs"),
            Err(SyncError::HistoryNotFound { .. })
        ));
    }

    #[test]
    fn test_record_folder_skips_unchanged() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = HistoryStore::new(&tx);
        store.create_history("docs").unwrap();

        let folder = temp.path().join("docs");
        std::fs::create_dir(&folder).unwrap();
        std::fs::write(folder.join("a.txt"), "hello").unwrap();

        assert!(store.record_folder("docs", &folder).unwrap().is_some());
        assert!(store.record_folder("docs", &folder).unwrap().is_none());

        std::fs::write(folder.join("b.txt"), "world").unwrap();
        let snapshot = store.record_folder("docs", &folder).unwrap().unwrap();
        assert_eq!(snapshot.root.files().unwrap().len(), 2);
    }
}
