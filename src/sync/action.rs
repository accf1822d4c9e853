use super::items::{Item, ItemStore};
use crate::diff::ChangeType;
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use crate::history::FileReference;
use crate::path::RelativePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncActionState {
    Queued,
    Active,
    Completed,
    Cancelled,
}

impl SyncActionState {
    pub fn can_transition_to(self, next: SyncActionState) -> bool {
        use SyncActionState::*;
        matches!(
            (self, next),
            (Queued, Active) | (Active, Completed) | (Queued, Cancelled) | (Active, Cancelled)
        )
    }

    /// Queued or Active
    pub fn is_pending(self) -> bool {
        matches!(self, SyncActionState::Queued | SyncActionState::Active)
    }
}

impl std::fmt::Display for SyncActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncActionState::Queued => write!(f, "queued"),
            SyncActionState::Active => write!(f, "active"),
            SyncActionState::Completed => write!(f, "completed"),
            SyncActionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// File operation that brings replicas of one path to the winning version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAction {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub path: RelativePath,
    pub from_version: Option<FileReference>,
    pub to_version: Option<FileReference>,
    state: SyncActionState,
    pub sync_point_id: u64,
    /// History whose version won
    pub source: String,
}

impl SyncAction {
    /// New queued action; the type must match the two versions
    pub fn new(
        path: RelativePath,
        from_version: Option<FileReference>,
        to_version: Option<FileReference>,
        sync_point_id: u64,
        source: impl Into<String>,
    ) -> Result<Self> {
        let change_type = ChangeType::between(&from_version, &to_version).ok_or_else(|| {
            SyncError::InvalidChange(format!("sync action for {} without versions", path))
        })?;

        Ok(Self {
            id: Uuid::new_v4(),
            change_type,
            path,
            from_version,
            to_version,
            state: SyncActionState::Queued,
            sync_point_id,
            source: source.into(),
        })
    }

    pub fn state(&self) -> SyncActionState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn transition(&mut self, next: SyncActionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                id: self.id.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!("Sync action {} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn activate(&mut self) -> Result<()> {
        self.transition(SyncActionState::Active)
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(SyncActionState::Completed)
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(SyncActionState::Cancelled)
    }
}

impl Item for SyncAction {
    type Key = Uuid;
    const KIND: &'static str = "actions";

    fn key(&self) -> Uuid {
        self.id
    }
}

/// Persistent sync actions
pub struct SyncActionStore<'a> {
    items: ItemStore<'a, SyncAction>,
}

impl<'a> SyncActionStore<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            items: ItemStore::new(tx),
        }
    }

    pub fn items(&self) -> Result<Vec<SyncAction>> {
        self.items.items()
    }

    pub fn get(&self, id: &Uuid) -> Result<SyncAction> {
        self.items.get(id)
    }

    /// Store new actions; all of them must still be queued
    pub fn add_items(&self, actions: Vec<SyncAction>) -> Result<()> {
        if let Some(action) = actions.iter().find(|a| a.state != SyncActionState::Queued) {
            return Err(SyncError::InvalidStateTransition {
                id: action.id.to_string(),
                from: action.state.to_string(),
                to: SyncActionState::Queued.to_string(),
            });
        }
        self.items.add_items(actions)
    }

    /// Replace stored actions; each stored state may only stay or advance
    pub fn update_items(&self, actions: Vec<SyncAction>) -> Result<()> {
        let stored: BTreeMap<Uuid, SyncActionState> =
            self.items()?.into_iter().map(|a| (a.id, a.state)).collect();
        for action in &actions {
            let current = match stored.get(&action.id) {
                Some(state) => *state,
                None => continue,
            };
            if current != action.state && !current.can_transition_to(action.state) {
                return Err(SyncError::InvalidStateTransition {
                    id: action.id.to_string(),
                    from: current.to_string(),
                    to: action.state.to_string(),
                });
            }
        }
        self.items.update_items(actions)
    }

    pub fn remove_items(&self, ids: &[Uuid]) -> Result<()> {
        self.items.remove_items(ids)
    }

    pub fn by_state(&self, state: SyncActionState) -> Result<Vec<SyncAction>> {
        self.filtered(|a| a.state == state)
    }

    pub fn by_path(&self, path: &RelativePath) -> Result<Vec<SyncAction>> {
        self.filtered(|a| &a.path == path)
    }

    pub fn by_state_and_path(
        &self,
        state: SyncActionState,
        path: &RelativePath,
    ) -> Result<Vec<SyncAction>> {
        self.filtered(|a| a.state == state && &a.path == path)
    }

    /// Queued and active actions
    pub fn pending(&self) -> Result<Vec<SyncAction>> {
        self.filtered(SyncAction::is_pending)
    }

    /// Move one stored action to `next`
    pub fn set_state(&self, id: &Uuid, next: SyncActionState) -> Result<SyncAction> {
        let mut action = self.get(id)?;
        action.transition(next)?;
        self.update_items(vec![action.clone()])?;
        Ok(action)
    }

    /// Cancel every given action in one write
    pub fn cancel(&self, mut actions: Vec<SyncAction>) -> Result<()> {
        for action in &mut actions {
            action.cancel()?;
        }
        if !actions.is_empty() {
            tracing::debug!("Cancelling {} sync action(s)", actions.len());
        }
        self.update_items(actions)
    }

    fn filtered(&self, keep: impl Fn(&SyncAction) -> bool) -> Result<Vec<SyncAction>> {
        Ok(self.items()?.into_iter().filter(|a| keep(a)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use git2::Repository;
    use tempfile::TempDir;

    fn file(path: &str, length: u64) -> FileReference {
        FileReference::new(
            RelativePath::parse(path).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            length,
        )
    }

    fn added(path: &str) -> SyncAction {
        SyncAction::new(
            RelativePath::parse(path).unwrap(),
            None,
            Some(file(path, 1)),
            1,
            "docs",
        )
        .unwrap()
    }

    fn active_tx(temp: &TempDir) -> Transaction {
        let remote = temp.path().join("remote.git");
        Repository::init_bare(&remote).unwrap();
        let mut tx = Transaction::new(remote.to_str().unwrap(), temp.path().join("local"));
        tx.begin().unwrap();
        tx
    }

    #[test]
    fn test_new_action_type_from_versions() {
        let path = RelativePath::parse("a.txt").unwrap();
        let deleted = SyncAction::new(path.clone(), Some(file("a.txt", 1)), None, 1, "x").unwrap();
        assert_eq!(deleted.change_type, ChangeType::Deleted);
        assert_eq!(deleted.state(), SyncActionState::Queued);

        let modified =
            SyncAction::new(path.clone(), Some(file("a.txt", 1)), Some(file("a.txt", 2)), 1, "x")
                .unwrap();
        assert_eq!(modified.change_type, ChangeType::Modified);

        assert!(SyncAction::new(path, None, None, 1, "x").is_err());
    }

    #[test]
    fn test_state_machine() {
        let mut action = added("a.txt");
        action.activate().unwrap();
        action.complete().unwrap();
        assert!(matches!(
            action.cancel(),
            Err(SyncError::InvalidStateTransition { .. })
        ));

        let mut action = added("a.txt");
        action.cancel().unwrap();
        assert!(action.activate().is_err());
        assert!(action.complete().is_err());

        let mut action = added("a.txt");
        assert!(action.complete().is_err());
        action.activate().unwrap();
        action.cancel().unwrap();
        assert!(!action.is_pending());
    }

    #[test]
    fn test_store_queries() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = SyncActionStore::new(&tx);

        let a = added("a.txt");
        let b = added("b.txt");
        let c = added("A.TXT");
        store.add_items(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        store.set_state(&b.id, SyncActionState::Active).unwrap();

        let path_a = RelativePath::parse("a.txt").unwrap();
        assert_eq!(store.by_path(&path_a).unwrap().len(), 2);
        assert_eq!(store.by_state(SyncActionState::Active).unwrap().len(), 1);
        assert_eq!(
            store
                .by_state_and_path(SyncActionState::Queued, &path_a)
                .unwrap()
                .len(),
            2
        );
        assert_eq!(store.pending().unwrap().len(), 3);

        store.cancel(store.by_path(&path_a).unwrap()).unwrap();
        assert_eq!(store.pending().unwrap().len(), 1);
        assert_eq!(
            store.by_state(SyncActionState::Cancelled).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_store_rejects_bad_writes() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = SyncActionStore::new(&tx);

        let a = added("a.txt");
        store.add_items(vec![a.clone()]).unwrap();
        assert!(matches!(
            store.add_items(vec![a.clone()]),
            Err(SyncError::DuplicateItem { .. })
        ));

        let mut active = added("b.txt");
        active.activate().unwrap();
        assert!(matches!(
            store.add_items(vec![active]),
            Err(SyncError::InvalidStateTransition { .. })
        ));

        let unknown = added("c.txt");
        assert!(matches!(
            store.update_items(vec![unknown.clone()]),
            Err(SyncError::ItemNotFound { .. })
        ));
        assert!(matches!(
            store.remove_items(&[unknown.id]),
            Err(SyncError::ItemNotFound { .. })
        ));

        store.remove_items(&[a.id]).unwrap();
        assert!(store.items().unwrap().is_empty());
    }

    #[test]
    fn test_update_cannot_revive_finished_action() {
        let temp = TempDir::new().unwrap();
        let tx = active_tx(&temp);
        let store = SyncActionStore::new(&tx);

        let action = added("a.txt");
        store.add_items(vec![action.clone()]).unwrap();
        store.set_state(&action.id, SyncActionState::Active).unwrap();
        store.set_state(&action.id, SyncActionState::Completed).unwrap();

        // A copy read before the action finished
        let mut stale = action.clone();
        stale.activate().unwrap();
        assert!(matches!(
            store.update_items(vec![stale]),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert_eq!(
            store.get(&action.id).unwrap().state(),
            SyncActionState::Completed
        );

        // Rewriting the stored state unchanged is fine
        let done = store.get(&action.id).unwrap();
        store.update_items(vec![done]).unwrap();
    }
}
