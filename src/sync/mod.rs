// Multi-replica synchronization
//
// Every history is one replica. A sync run compares the latest snapshot of
// every replica with the snapshot set of the last sync point, merges the
// per-path changes into a change graph and turns the result into queued
// sync actions or conflicts. Sync actions are only recorded here; carrying
// them out against the filesystem is up to the caller.

pub mod action;
pub mod conflict;
pub mod engine;
pub mod items;
pub mod point;

pub use action::{SyncAction, SyncActionState, SyncActionStore};
pub use conflict::{ConflictDetector, ConflictInfo, ConflictStore, MultiVersionConflict};
pub use engine::SyncEngine;
pub use items::{Item, ItemStore};
pub use point::{SyncPoint, SyncPointStore};

use crate::diff::{ChangeList, Equivalence, MetadataEquality, Optional};
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use crate::graph::{ChangeGraph, NodeId};
use crate::history::{FileReference, HistoryStore, Snapshot, SnapshotId, SnapshotSetStore};
use crate::path::RelativePath;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

type PathGraph = ChangeGraph<Option<FileReference>, Optional<MetadataEquality>>;

/// What one sync run produced
#[derive(Debug, Default)]
pub struct SynchronizerResult {
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<MultiVersionConflict>,
    /// New sync point; `None` when nothing changed
    pub sync_point: Option<SyncPoint>,
    /// Pending actions that were cancelled
    pub cancelled: usize,
}

impl SynchronizerResult {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.conflicts.is_empty()
    }
}

/// Outcome for one changed path
enum Decision {
    Conflict(MultiVersionConflict),
    Action {
        path: RelativePath,
        from: Option<FileReference>,
        to: Option<FileReference>,
        source: String,
    },
    /// Replicas agree on this version; no new action is needed
    Settled(Option<FileReference>),
}

pub struct Synchronizer<'a> {
    tx: &'a Transaction,
    equality: MetadataEquality,
}

impl<'a> Synchronizer<'a> {
    pub fn new(tx: &'a Transaction, equality: MetadataEquality) -> Self {
        Self { tx, equality }
    }

    pub fn histories(&self) -> HistoryStore<'a> {
        HistoryStore::new(self.tx)
    }

    pub fn snapshot_sets(&self) -> SnapshotSetStore<'a> {
        SnapshotSetStore::new(self.tx)
    }

    pub fn sync_points(&self) -> SyncPointStore<'a> {
        SyncPointStore::new(self.tx)
    }

    pub fn conflicts(&self) -> ConflictStore<'a> {
        ConflictStore::new(self.tx)
    }

    pub fn actions(&self) -> SyncActionStore<'a> {
        SyncActionStore::new(self.tx)
    }

    /// Changes of one folder between two of its snapshots
    pub fn diff(
        &self,
        history: &str,
        from: Option<&SnapshotId>,
        to: &SnapshotId,
    ) -> Result<Vec<ChangeList>> {
        self.histories().changes(history, from, to, &self.equality)
    }

    /// Turn everything that changed since the last sync point into sync
    /// actions and conflicts, then advance the sync point
    pub fn synchronize(&self) -> Result<SynchronizerResult> {
        let histories = self.histories();
        let sync_points = self.sync_points();

        let current = histories.latest_ids()?;
        let baseline_point = sync_points.latest()?;
        let baseline = match &baseline_point {
            Some(point) => self.snapshot_sets().get(&point.snapshot_set_id)?.snapshots,
            None => BTreeMap::new(),
        };

        if current == baseline {
            tracing::info!("Nothing changed since the last sync point");
            return Ok(SynchronizerResult::default());
        }

        let pending = self.actions().pending()?;
        let mut cancel: BTreeSet<Uuid> = BTreeSet::new();

        for name in baseline.keys().filter(|name| !current.contains_key(*name)) {
            tracing::info!("History {} was removed", name);
            cancel.extend(pending.iter().filter(|a| &a.source == name).map(|a| a.id));
        }

        let mut latest: BTreeMap<String, Snapshot> = BTreeMap::new();
        let mut changes: BTreeMap<String, BTreeMap<RelativePath, ChangeList>> = BTreeMap::new();
        for (name, id) in &current {
            let lists = self.changes_since(&histories, name, baseline.get(name), id)?;
            tracing::debug!("{}: {} changed path(s)", name, lists.len());
            changes.insert(
                name.clone(),
                lists.into_iter().map(|l| (l.path().clone(), l)).collect(),
            );
            latest.insert(name.clone(), histories.get_snapshot(name, id)?);
        }

        let in_conflict: BTreeSet<RelativePath> = self
            .conflicts()
            .items()?
            .into_iter()
            .map(|c| c.file_path)
            .collect();
        let changed: BTreeSet<&RelativePath> = changes.values().flat_map(|m| m.keys()).collect();

        let mut decisions = Vec::new();
        for path in changed {
            if in_conflict.contains(path) {
                tracing::debug!("Skipping {}: unresolved conflict", path);
                continue;
            }
            let pending_here: Vec<&SyncAction> =
                pending.iter().filter(|a| &a.path == path).collect();
            let decision = self.decide(path, &latest, &changes, &pending_here)?;

            match &decision {
                Decision::Conflict(_) | Decision::Action { .. } => {
                    cancel.extend(pending_here.iter().map(|a| a.id));
                }
                Decision::Settled(winner) => {
                    // Keep pending actions still heading for the winner
                    cancel.extend(
                        pending_here
                            .iter()
                            .filter(|a| !Optional(self.equality).equivalent(&a.to_version, winner))
                            .map(|a| a.id),
                    );
                }
            }
            decisions.push(decision);
        }

        let set = self.snapshot_sets().record(current)?;
        let point = sync_points.advance(set.id.clone())?;

        let mut result = SynchronizerResult {
            sync_point: Some(point.clone()),
            ..Default::default()
        };
        let mut conflict_infos = Vec::new();
        for decision in decisions {
            match decision {
                Decision::Conflict(conflict) => {
                    conflict_infos.push(ConflictInfo {
                        file_path: conflict.path().clone(),
                        snapshot_id: set.id.clone(),
                    });
                    result.conflicts.push(conflict);
                }
                Decision::Action {
                    path,
                    from,
                    to,
                    source,
                } => result
                    .actions
                    .push(SyncAction::new(path, from, to, point.id, source)?),
                Decision::Settled(_) => {}
            }
        }

        let cancelled: Vec<SyncAction> = pending
            .into_iter()
            .filter(|a| cancel.contains(&a.id))
            .collect();
        result.cancelled = cancelled.len();
        self.actions().cancel(cancelled)?;
        self.actions().add_items(result.actions.clone())?;
        self.conflicts().add_items(conflict_infos)?;

        tracing::info!(
            "Sync point {}: {} action(s), {} conflict(s), {} cancelled",
            point.id,
            result.actions.len(),
            result.conflicts.len(),
            result.cancelled
        );
        Ok(result)
    }

    /// Drop a conflict, optionally queueing the version held by `keep`
    pub fn resolve(&self, path: &RelativePath, keep: Option<&str>) -> Result<Option<SyncAction>> {
        let conflict = self.conflicts().get(path)?;
        self.conflicts().remove_items(&[conflict.file_path.clone()])?;
        tracing::info!("Resolved conflict on {}", conflict.file_path);

        let keep = match keep {
            Some(keep) => keep,
            None => return Ok(None),
        };

        let histories = self.histories();
        let chosen = Self::value_in(&histories.latest_snapshot(keep)?, path)?;
        let mut other = None;
        for name in histories.histories()? {
            if name == keep {
                continue;
            }
            let value = Self::value_in(&histories.latest_snapshot(&name)?, path)?;
            if !Optional(self.equality).equivalent(&value, &chosen) {
                other = Some(value);
                break;
            }
        }

        let from = match other {
            Some(from) => from,
            None => return Ok(None),
        };
        let sync_point_id = self.sync_points().latest()?.map_or(0, |p| p.id);
        let action = SyncAction::new(path.clone(), from, chosen, sync_point_id, keep)?;

        let actions = self.actions();
        actions.cancel(
            actions
                .pending()?
                .into_iter()
                .filter(|a| &a.path == path)
                .collect(),
        )?;
        actions.add_items(vec![action.clone()])?;
        Ok(Some(action))
    }

    fn changes_since(
        &self,
        histories: &HistoryStore<'_>,
        name: &str,
        baseline: Option<&SnapshotId>,
        latest: &SnapshotId,
    ) -> Result<Vec<ChangeList>> {
        match histories.changes(name, baseline, latest, &self.equality) {
            Err(SyncError::SnapshotNotFound { .. }) | Err(SyncError::UnrelatedSnapshots { .. })
                if baseline.is_some() =>
            {
                tracing::warn!("History {} was recreated since the last sync point", name);
                histories.changes(name, None, latest, &self.equality)
            }
            other => other,
        }
    }

    fn value_in(snapshot: &Snapshot, path: &RelativePath) -> Result<Option<FileReference>> {
        match snapshot.root.file(path)? {
            Some(file) => Ok(Some(file.reference()?.clone())),
            None => Ok(None),
        }
    }

    /// Merge every replica's view of `path` into one graph
    ///
    /// Returns the graph and the newest node of each replica.
    fn build_graph(
        &self,
        path: &RelativePath,
        latest: &BTreeMap<String, Snapshot>,
        changes: &BTreeMap<String, BTreeMap<RelativePath, ChangeList>>,
        pending: &[&SyncAction],
    ) -> Result<(PathGraph, Vec<(String, NodeId)>)> {
        let mut graph = ChangeGraph::new(Optional(self.equality));
        let mut heads = Vec::with_capacity(latest.len());

        for (name, snapshot) in latest {
            let list = changes.get(name).and_then(|m| m.get(path));
            let head = match list {
                Some(list) => {
                    let base = list.first().from_file().cloned();
                    let mut head = graph.add_edge_from_start(base.clone(), 0);
                    let mut previous = (base, 0);
                    for (i, change) in list.iter().enumerate() {
                        let value = change.to_file().cloned();
                        head = graph.add_edge(&previous.0, previous.1, value.clone(), i + 1)?;
                        previous = (value, i + 1);
                    }
                    head
                }
                None => graph.add_edge_from_start(Self::value_in(snapshot, path)?, 0),
            };
            heads.push((name.clone(), head));
        }

        for action in pending {
            graph.add_edge_from_start(action.from_version.clone(), 0);
            graph.add_edge(&action.from_version, 0, action.to_version.clone(), 0)?;
        }

        Ok((graph, heads))
    }

    fn decide(
        &self,
        path: &RelativePath,
        latest: &BTreeMap<String, Snapshot>,
        changes: &BTreeMap<String, BTreeMap<RelativePath, ChangeList>>,
        pending: &[&SyncAction],
    ) -> Result<Decision> {
        let (graph, heads) = self.build_graph(path, latest, changes, pending)?;
        let nodes: Vec<NodeId> = heads.iter().map(|(_, node)| *node).collect();

        if let Some(conflict) = ConflictDetector::detect(&graph, path, &nodes)? {
            return Ok(Decision::Conflict(conflict));
        }

        let winner = match ConflictDetector::distinct_leading(&graph, &nodes).first() {
            Some(node) => *node,
            None => return Ok(Decision::Settled(None)),
        };
        let to = graph.value(winner).cloned().flatten();

        let (holding, lagging): (Vec<_>, Vec<_>) = heads
            .iter()
            .partition(|(_, node)| graph.same_value(*node, winner));

        let from_node = match (lagging.is_empty(), holding.as_slice()) {
            // Every replica already holds the winner
            (true, [_, _, ..]) => return Ok(Decision::Settled(to)),
            // A lone replica changed the path: start from where it began
            (true, _) => Self::earliest(&graph, &graph.roots_of(winner)).unwrap_or(winner),
            (false, _) => {
                let behind: Vec<NodeId> = lagging.iter().map(|(_, node)| *node).collect();
                Self::earliest(&graph, &behind).unwrap_or(winner)
            }
        };
        let from = graph.value(from_node).cloned().flatten();

        let same = Optional(self.equality);
        if same.equivalent(&from, &to) {
            return Ok(Decision::Settled(to));
        }
        if pending
            .iter()
            .any(|a| same.equivalent(&a.to_version, &to) && same.equivalent(&a.from_version, &from))
        {
            tracing::debug!("{} already has a pending action", path);
            return Ok(Decision::Settled(to));
        }

        let source = holding
            .first()
            .map(|(name, _)| name.clone())
            .unwrap_or_default();

        let path = to
            .as_ref()
            .or(from.as_ref())
            .map(|f| f.path.clone())
            .unwrap_or_else(|| path.clone());
        Ok(Decision::Action {
            path,
            from,
            to,
            source,
        })
    }

    /// First of `nodes` that no other member with a different value precedes
    fn earliest(graph: &PathGraph, nodes: &[NodeId]) -> Option<NodeId> {
        nodes
            .iter()
            .find(|n| {
                !nodes
                    .iter()
                    .any(|other| !graph.same_value(*other, **n) && graph.is_ancestor(*other, **n))
            })
            .or_else(|| nodes.first())
            .copied()
    }
}
