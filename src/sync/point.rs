use super::items::{Item, ItemStore};
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use crate::history::SnapshotSetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot set that has been fully synchronized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPoint {
    pub id: u64,
    pub snapshot_set_id: SnapshotSetId,
    pub created: DateTime<Utc>,
}

impl Item for SyncPoint {
    type Key = u64;
    const KIND: &'static str = "sync-points";

    fn key(&self) -> u64 {
        self.id
    }
}

pub struct SyncPointStore<'a> {
    items: ItemStore<'a, SyncPoint>,
}

impl<'a> SyncPointStore<'a> {
    pub fn new(tx: &'a Transaction) -> Self {
        Self {
            items: ItemStore::new(tx),
        }
    }

    pub fn items(&self) -> Result<Vec<SyncPoint>> {
        self.items.items()
    }

    pub fn get(&self, id: u64) -> Result<SyncPoint> {
        self.items.get(&id)
    }

    /// Sync point with the highest id
    pub fn latest(&self) -> Result<Option<SyncPoint>> {
        Ok(self.items.items()?.pop())
    }

    /// Store a sync point; its id must be above the latest one
    pub fn add(&self, point: SyncPoint) -> Result<()> {
        if let Some(latest) = self.latest()? {
            if point.id <= latest.id {
                return Err(SyncError::DuplicateItem {
                    key: point.id.to_string(),
                });
            }
        }
        tracing::debug!("Adding sync point {} for {}", point.id, point.snapshot_set_id);
        self.items.add_items(vec![point])
    }

    /// Store the next sync point for `snapshot_set_id`
    pub fn advance(&self, snapshot_set_id: SnapshotSetId) -> Result<SyncPoint> {
        let id = self.latest()?.map_or(1, |latest| latest.id + 1);
        let point = SyncPoint {
            id,
            snapshot_set_id,
            created: Utc::now(),
        };
        self.add(point.clone())?;
        Ok(point)
    }
}
