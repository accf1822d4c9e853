use super::{FileProperties, FileReference};
use crate::error::{Result, SyncError};
use crate::path::RelativePath;
use git2::{ObjectType, Oid, Repository};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared, serialized access to the object database for lazy tree reads
pub(crate) struct TreeReader {
    repo: Mutex<Repository>,
    loads: AtomicUsize,
}

impl TreeReader {
    pub(crate) fn open(path: &Path) -> Result<Arc<Self>> {
        let repo = Repository::open(path)?;
        Ok(Arc::new(Self {
            repo: Mutex::new(repo),
            loads: AtomicUsize::new(0),
        }))
    }

    fn read_children(
        self: &Arc<Self>,
        tree_id: Oid,
        parent: Option<&RelativePath>,
    ) -> Result<Vec<Entry>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let repo = self.repo.lock().unwrap_or_else(|e| e.into_inner());
        let tree = repo.find_tree(tree_id)?;

        let mut entries = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let name = match item.name() {
                Some(name) => name.to_string(),
                None => {
                    tracing::warn!("Skipping non UTF-8 entry in tree {}", tree_id);
                    continue;
                }
            };
            let path = match parent {
                Some(parent) => parent.join(&name)?,
                None => RelativePath::parse(&name)?,
            };

            match item.kind() {
                Some(ObjectType::Tree) => entries.push(Entry::Directory(DirectoryNode {
                    path: Some(path),
                    tree_id: item.id(),
                    reader: Arc::clone(self),
                    children: OnceCell::new(),
                })),
                Some(ObjectType::Blob) => entries.push(Entry::File(FileEntry {
                    path,
                    blob_id: item.id(),
                    reader: Arc::clone(self),
                    properties: OnceCell::new(),
                })),
                _ => tracing::debug!("Ignoring {} in tree {}", name, tree_id),
            }
        }

        Ok(entries)
    }

    fn read_blob(&self, blob_id: Oid) -> Result<Vec<u8>> {
        let repo = self.repo.lock().unwrap_or_else(|e| e.into_inner());
        let blob = repo.find_blob(blob_id)?;
        Ok(blob.content().to_vec())
    }

    #[cfg(test)]
    fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

/// Lazy read-only view of one snapshot's directory hierarchy
///
/// Nothing is read until a directory's children are requested, and each
/// directory is read at most once even when several threads ask at the
/// same time.
#[derive(Clone)]
pub struct SnapshotTree {
    root: Arc<DirectoryNode>,
}

impl SnapshotTree {
    pub(crate) fn new(reader: Arc<TreeReader>, tree_id: Oid) -> Self {
        Self {
            root: Arc::new(DirectoryNode {
                path: None,
                tree_id,
                reader,
                children: OnceCell::new(),
            }),
        }
    }

    pub fn root(&self) -> &DirectoryNode {
        &self.root
    }

    /// Look up a file by path
    pub fn file(&self, path: &RelativePath) -> Result<Option<&FileEntry>> {
        let mut dir: &DirectoryNode = &self.root;
        let components: Vec<&str> = path.components().collect();
        let (last, parents) = match components.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };

        for name in parents {
            match dir.get(name)? {
                Some(Entry::Directory(child)) => dir = child,
                _ => return Ok(None),
            }
        }

        match dir.get(last)? {
            Some(Entry::File(file)) => Ok(Some(file)),
            _ => Ok(None),
        }
    }

    /// Every file in the snapshot (reads the whole tree)
    pub fn files(&self) -> Result<Vec<FileReference>> {
        let mut files = Vec::new();
        self.root.collect_files(&mut files)?;
        Ok(files)
    }
}

/// One entry of a snapshot tree
pub enum Entry {
    File(FileEntry),
    Directory(DirectoryNode),
}

impl Entry {
    pub fn name(&self) -> &str {
        match self {
            Entry::File(file) => file.path.name(),
            Entry::Directory(dir) => dir.path.as_ref().map_or("", |p| p.name()),
        }
    }

    /// Object id; equal ids mean equal content
    pub fn object_id(&self) -> Oid {
        match self {
            Entry::File(file) => file.blob_id,
            Entry::Directory(dir) => dir.tree_id,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory(_))
    }
}

pub struct FileEntry {
    path: RelativePath,
    blob_id: Oid,
    reader: Arc<TreeReader>,
    properties: OnceCell<FileReference>,
}

impl FileEntry {
    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    pub fn blob_id(&self) -> Oid {
        self.blob_id
    }

    /// Raw bytes of the stored blob
    pub fn read(&self) -> Result<Vec<u8>> {
        self.reader.read_blob(self.blob_id)
    }

    /// Recorded file version
    pub fn reference(&self) -> Result<&FileReference> {
        self.properties.get_or_try_init(|| {
            let bytes = self.read()?;
            let props: FileProperties = serde_json::from_slice(&bytes)?;
            Ok::<_, SyncError>(FileReference::new(
                self.path.clone(),
                props.last_write_time,
                props.length,
            ))
        })
    }
}

pub struct DirectoryNode {
    path: Option<RelativePath>,
    tree_id: Oid,
    reader: Arc<TreeReader>,
    children: OnceCell<Vec<Entry>>,
}

impl DirectoryNode {
    /// `None` for the snapshot root
    pub fn path(&self) -> Option<&RelativePath> {
        self.path.as_ref()
    }

    pub fn tree_id(&self) -> Oid {
        self.tree_id
    }

    /// Direct children, materialized on first call
    pub fn children(&self) -> Result<&[Entry]> {
        let children = self
            .children
            .get_or_try_init(|| self.reader.read_children(self.tree_id, self.path.as_ref()))?;
        Ok(children.as_slice())
    }

    pub fn is_loaded(&self) -> bool {
        self.children.get().is_some()
    }

    /// Child by name, ignoring case
    pub fn get(&self, name: &str) -> Result<Option<&Entry>> {
        let wanted = name.to_lowercase();
        Ok(self
            .children()?
            .iter()
            .find(|e| e.name().to_lowercase() == wanted))
    }

    pub fn files(&self) -> Result<impl Iterator<Item = &FileEntry>> {
        Ok(self.children()?.iter().filter_map(|e| match e {
            Entry::File(file) => Some(file),
            Entry::Directory(_) => None,
        }))
    }

    pub fn directories(&self) -> Result<impl Iterator<Item = &DirectoryNode>> {
        Ok(self.children()?.iter().filter_map(|e| match e {
            Entry::Directory(dir) => Some(dir),
            Entry::File(_) => None,
        }))
    }

    pub(crate) fn collect_files(&self, out: &mut Vec<FileReference>) -> Result<()> {
        for entry in self.children()? {
            match entry {
                Entry::File(file) => out.push(file.reference()?.clone()),
                Entry::Directory(dir) => dir.collect_files(out)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob(repo: &Repository, length: u64) -> Oid {
        let props = FileProperties {
            last_write_time: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            length,
        };
        repo.blob(&serde_json::to_vec(&props).unwrap()).unwrap()
    }

    /// root: a.txt, Sub/b.txt, Sub/Deep/c.txt
    fn sample_tree(temp: &TempDir) -> (Arc<TreeReader>, Oid) {
        let repo = Repository::init_bare(temp.path()).unwrap();

        let mut deep = repo.treebuilder(None).unwrap();
        deep.insert("c.txt", blob(&repo, 3), 0o100644).unwrap();
        let deep_id = deep.write().unwrap();

        let mut sub = repo.treebuilder(None).unwrap();
        sub.insert("b.txt", blob(&repo, 2), 0o100644).unwrap();
        sub.insert("Deep", deep_id, 0o040000).unwrap();
        let sub_id = sub.write().unwrap();

        let mut root = repo.treebuilder(None).unwrap();
        root.insert("a.txt", blob(&repo, 1), 0o100644).unwrap();
        root.insert("Sub", sub_id, 0o040000).unwrap();
        let root_id = root.write().unwrap();

        (TreeReader::open(temp.path()).unwrap(), root_id)
    }

    #[test]
    fn test_children_are_lazy() {
        let temp = TempDir::new().unwrap();
        let (reader, root_id) = sample_tree(&temp);
        let tree = SnapshotTree::new(Arc::clone(&reader), root_id);

        assert!(!tree.root().is_loaded());
        assert_eq!(reader.load_count(), 0);

        let children = tree.root().children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(reader.load_count(), 1);

        let sub = match tree.root().get("sub").unwrap() {
            Some(Entry::Directory(dir)) => dir,
            _ => panic!("expected directory"),
        };
        assert!(!sub.is_loaded());
        assert_eq!(sub.path().unwrap().as_str(), "Sub");
    }

    #[test]
    fn test_file_lookup_and_properties() {
        let temp = TempDir::new().unwrap();
        let (reader, root_id) = sample_tree(&temp);
        let tree = SnapshotTree::new(reader, root_id);

        let path = RelativePath::parse("sub/deep/C.TXT").unwrap();
        let file = tree.file(&path).unwrap().unwrap();
        assert_eq!(file.path().as_str(), "Sub/Deep/c.txt");
        assert_eq!(file.reference().unwrap().length, 3);

        let missing = RelativePath::parse("sub/nothing.txt").unwrap();
        assert!(tree.file(&missing).unwrap().is_none());

        // A directory is not a file
        assert!(tree
            .file(&RelativePath::parse("Sub").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_files_flattens_tree() {
        let temp = TempDir::new().unwrap();
        let (reader, root_id) = sample_tree(&temp);
        let tree = SnapshotTree::new(reader, root_id);

        let mut paths: Vec<String> = tree
            .files()
            .unwrap()
            .into_iter()
            .map(|f| f.path.to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["Sub/Deep/c.txt", "Sub/b.txt", "a.txt"]);
    }

    #[test]
    fn test_concurrent_first_reads_materialize_once() {
        let temp = TempDir::new().unwrap();
        let (reader, root_id) = sample_tree(&temp);
        let tree = SnapshotTree::new(Arc::clone(&reader), root_id);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let tree = tree.clone();
                scope.spawn(move || {
                    assert_eq!(tree.root().children().unwrap().len(), 2);
                });
            }
        });

        assert_eq!(reader.load_count(), 1);
    }
}
