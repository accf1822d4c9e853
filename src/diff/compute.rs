use super::{Change, ChangeList, Equivalence};
use crate::error::Result;
use crate::history::{DirectoryNode, Entry, FileReference, Snapshot};
use crate::path::RelativePath;
use std::collections::BTreeMap;

type Changes = BTreeMap<RelativePath, Vec<Change>>;

/// Diff consecutive snapshots into one change list per changed path
///
/// `snapshots` must be ordered oldest first. Paths that are equal under
/// `equality` at every step produce nothing. Subtrees with the same tree id
/// in two consecutive snapshots are skipped without being read.
pub fn compute_changes(
    snapshots: &[Snapshot],
    equality: &dyn Equivalence<FileReference>,
) -> Result<Vec<ChangeList>> {
    let mut changes = Changes::new();

    for pair in snapshots.windows(2) {
        let (old, new) = (&pair[0], &pair[1]);
        tracing::trace!("Diffing {} -> {} in {}", old.id, new.id, new.history);
        diff_directories(old.root.root(), new.root.root(), equality, &mut changes)?;
    }

    let lists = changes
        .into_values()
        .map(ChangeList::new)
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!("{} changed path(s) across {} snapshot(s)", lists.len(), snapshots.len());
    Ok(lists)
}

fn diff_directories(
    old: &DirectoryNode,
    new: &DirectoryNode,
    equality: &dyn Equivalence<FileReference>,
    changes: &mut Changes,
) -> Result<()> {
    if old.tree_id() == new.tree_id() {
        return Ok(());
    }

    // lowercased name -> (old entry, new entry)
    let mut paired: BTreeMap<String, (Option<&Entry>, Option<&Entry>)> = BTreeMap::new();
    for entry in old.children()? {
        paired.entry(entry.name().to_lowercase()).or_default().0 = Some(entry);
    }
    for entry in new.children()? {
        paired.entry(entry.name().to_lowercase()).or_default().1 = Some(entry);
    }

    for (old_entry, new_entry) in paired.into_values() {
        match (old_entry, new_entry) {
            (Some(Entry::Directory(old_dir)), Some(Entry::Directory(new_dir))) => {
                diff_directories(old_dir, new_dir, equality, changes)?;
            }
            (Some(Entry::File(old_file)), Some(Entry::File(new_file))) => {
                if old_file.blob_id() == new_file.blob_id() && old_file.path() == new_file.path() {
                    continue;
                }
                let (from, to) = (old_file.reference()?, new_file.reference()?);
                if !equality.equivalent(from, to) {
                    push(changes, Change::modified(from.clone(), to.clone())?);
                }
            }
            (old_entry, new_entry) => {
                if let Some(entry) = old_entry {
                    for file in files_of(entry)? {
                        push(changes, Change::deleted(file));
                    }
                }
                if let Some(entry) = new_entry {
                    for file in files_of(entry)? {
                        push(changes, Change::added(file));
                    }
                }
            }
        }
    }

    Ok(())
}

fn files_of(entry: &Entry) -> Result<Vec<FileReference>> {
    match entry {
        Entry::File(file) => Ok(vec![file.reference()?.clone()]),
        Entry::Directory(dir) => {
            let mut files = Vec::new();
            dir.collect_files(&mut files)?;
            Ok(files)
        }
    }
}

fn push(changes: &mut Changes, change: Change) {
    changes.entry(change.path().clone()).or_default().push(change);
}
