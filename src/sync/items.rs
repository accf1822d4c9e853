use crate::error::{Result, SyncError};
use crate::git::Transaction;
use git2::ObjectType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::marker::PhantomData;

const BRANCH_PREFIX: &str = "state/";
const FILE_NAME: &str = "items.json";

/// Something kept in an [`ItemStore`]
pub trait Item: Serialize + DeserializeOwned + Clone {
    type Key: Ord + Clone + Display;

    /// Branch suffix, e.g. `actions` for `state/actions`
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
}

/// Keyed collection persisted as one JSON document on its own branch
///
/// Every write is a commit through the active transaction, so it becomes
/// visible to other replicas only when the transaction is pushed.
pub struct ItemStore<'a, T> {
    tx: &'a Transaction,
    _item: PhantomData<T>,
}

impl<'a, T: Item> ItemStore<'a, T> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            tx,
            _item: PhantomData,
        }
    }

    fn branch() -> String {
        format!("{}{}", BRANCH_PREFIX, T::KIND)
    }

    /// All items ordered by key
    pub fn items(&self) -> Result<Vec<T>> {
        Ok(self.load()?.into_values().collect())
    }

    pub fn get(&self, key: &T::Key) -> Result<T> {
        self.load()?
            .remove(key)
            .ok_or_else(|| SyncError::ItemNotFound {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &T::Key) -> Result<bool> {
        Ok(self.load()?.contains_key(key))
    }

    pub fn add_items(&self, items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut current = self.load()?;
        let count = items.len();
        for item in items {
            let key = item.key();
            if current.contains_key(&key) {
                return Err(SyncError::DuplicateItem {
                    key: key.to_string(),
                });
            }
            current.insert(key, item);
        }
        self.save(&current, &format!("Add {} {}", count, T::KIND))
    }

    pub fn update_items(&self, items: Vec<T>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut current = self.load()?;
        let count = items.len();
        for item in items {
            match current.get_mut(&item.key()) {
                Some(slot) => *slot = item,
                None => {
                    return Err(SyncError::ItemNotFound {
                        key: item.key().to_string(),
                    })
                }
            }
        }
        self.save(&current, &format!("Update {} {}", count, T::KIND))
    }

    pub fn remove_items(&self, keys: &[T::Key]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut current = self.load()?;
        for key in keys {
            if current.remove(key).is_none() {
                return Err(SyncError::ItemNotFound {
                    key: key.to_string(),
                });
            }
        }
        self.save(&current, &format!("Remove {} {}", keys.len(), T::KIND))
    }

    fn load(&self) -> Result<BTreeMap<T::Key, T>> {
        let tip = match self.tx.branch_tip(&Self::branch())? {
            Some(tip) => tip,
            None => return Ok(BTreeMap::new()),
        };

        let repo = self.tx.repository()?;
        let tree = repo.find_commit(tip)?.tree()?;
        let entry = match tree.get_name(FILE_NAME) {
            Some(entry) => entry,
            None => return Ok(BTreeMap::new()),
        };
        let blob = repo
            .find_object(entry.id(), Some(ObjectType::Blob))?
            .peel_to_blob()?;
        let items: Vec<T> = serde_json::from_slice(blob.content())?;
        Ok(items.into_iter().map(|item| (item.key(), item)).collect())
    }

    fn save(&self, items: &BTreeMap<T::Key, T>, message: &str) -> Result<()> {
        let repo = self.tx.repository()?;
        let values: Vec<&T> = items.values().collect();
        let blob = repo.blob(&serde_json::to_vec_pretty(&values)?)?;
        let mut builder = repo.treebuilder(None)?;
        builder.insert(FILE_NAME, blob, 0o100644)?;
        let tree = builder.write()?;

        self.tx.commit_tree(&Self::branch(), tree, message)?;
        tracing::debug!("{} ({} stored)", message, items.len());
        Ok(())
    }
}
