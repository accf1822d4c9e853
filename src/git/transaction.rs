use super::caching::{self, ReuseDecision};
use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use git2::{BranchType, Commit, ErrorCode, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository, Signature};
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub(crate) const REMOTE_NAME: &str = "origin";
pub(crate) const FETCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";

const AUTHOR_NAME: &str = "syncpoint";
const AUTHOR_EMAIL: &str = "syncpoint@localhost";

/// Lifecycle of a [`Transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Active,
    Completed,
    Aborted,
    Failed,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Created => "Created",
            TransactionState::Active => "Active",
            TransactionState::Completed => "Completed",
            TransactionState::Aborted => "Aborted",
            TransactionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// How `begin()` obtains the local working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneStrategy {
    /// Always delete the working copy and clone
    Fresh,
    /// Reuse the working copy when it is provably in sync with the remote
    Reuse,
}

/// Unit of work against the shared history repository
///
/// Services borrow the transaction immutably and mutate local branches
/// through it; every branch they move is recorded and pushed on `commit()`.
/// Dropping an active transaction aborts it.
pub struct Transaction {
    remote: String,
    local_path: PathBuf,
    strategy: CloneStrategy,
    state: Cell<TransactionState>,
    repo: Option<Repository>,
    touched: RefCell<BTreeSet<String>>,
}

impl Transaction {
    pub fn new(remote: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local_path: local_path.into(),
            strategy: CloneStrategy::Fresh,
            state: Cell::new(TransactionState::Created),
            repo: None,
            touched: RefCell::new(BTreeSet::new()),
        }
    }

    /// Transaction that reuses its working copy when safe
    pub fn caching(remote: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        let mut tx = Self::new(remote, local_path);
        tx.strategy = CloneStrategy::Reuse;
        tx
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        if config.reuse_working_copy {
            Self::caching(&config.remote, &config.working_copy)
        } else {
            Self::new(&config.remote, &config.working_copy)
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn strategy(&self) -> CloneStrategy {
        self.strategy
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn expect_state(&self, expected: TransactionState) -> Result<()> {
        let actual = self.state.get();
        if actual != expected {
            return Err(SyncError::InvalidTransactionState { expected, actual });
        }
        Ok(())
    }

    /// Fail unless the transaction is active
    pub fn ensure_active(&self) -> Result<()> {
        self.expect_state(TransactionState::Active)
    }

    /// Obtain a local copy of the remote and make the transaction active
    pub fn begin(&mut self) -> Result<()> {
        self.expect_state(TransactionState::Created)?;
        let started = Instant::now();

        let result = match self.strategy {
            CloneStrategy::Fresh => self.clone_fresh(),
            CloneStrategy::Reuse => match caching::check_working_copy(&self.local_path, &self.remote) {
                ReuseDecision::Reuse(repo) => {
                    tracing::debug!("Reusing working copy at {}", self.local_path.display());
                    Ok(repo)
                }
                ReuseDecision::Reclone(reason) => {
                    tracing::info!("Recloning working copy: {}", reason);
                    self.clone_fresh()
                }
            },
        };

        match result {
            Ok(repo) => {
                self.repo = Some(repo);
                self.state.set(TransactionState::Active);
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transaction active"
                );
                Ok(())
            }
            Err(e) => {
                self.state.set(TransactionState::Failed);
                tracing::warn!("Transaction begin failed: {}", e);
                Err(e)
            }
        }
    }

    fn clone_fresh(&self) -> Result<Repository> {
        if self.local_path.exists() {
            std::fs::remove_dir_all(&self.local_path)?;
        }
        if let Some(parent) = self.local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Cloning {} into {}", self.remote, self.local_path.display());

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(None));

        let repo = git2::build::RepoBuilder::new()
            .bare(true)
            .remote_create(|repo, name, url| repo.remote_with_fetch(name, url, FETCH_REFSPEC))
            .fetch_options(fetch_options)
            .clone(&self.remote, &self.local_path)
            .map_err(|source| SyncError::Clone {
                remote: self.remote.clone(),
                path: self.local_path.clone(),
                source,
            })?;

        track_remote_branches(&repo)?;
        Ok(repo)
    }

    /// Push every touched branch and complete the transaction
    ///
    /// Fails with [`SyncError::TransactionFailed`] if the remote moved past
    /// the state this transaction started from on any touched branch.
    ///
    /// The push is not atomic across branches. Every branch is checked for a
    /// fast-forward against the refs the remote advertised before anything
    /// is sent, so a rejection normally leaves the remote untouched. A
    /// replica updating the remote between that check and the ref update can
    /// still let some branches land. Branches are pushed in name order, which
    /// puts `state/sync-points` after the histories, snapshot sets, actions
    /// and conflicts it refers to.
    pub fn commit(&mut self) -> Result<()> {
        self.expect_state(TransactionState::Active)?;

        let refs: Vec<String> = self.touched.borrow().iter().cloned().collect();
        if refs.is_empty() {
            tracing::debug!("Nothing to push");
            self.state.set(TransactionState::Completed);
            return Ok(());
        }

        match self.push(&refs) {
            Ok(()) => {
                self.state.set(TransactionState::Completed);
                tracing::info!("Pushed {} branch(es)", refs.len());
                Ok(())
            }
            Err(e) => {
                self.state.set(TransactionState::Failed);
                tracing::warn!("Transaction commit failed: {}", e);
                Err(e)
            }
        }
    }

    fn push(&self, refs: &[String]) -> Result<()> {
        let repo = self.repository()?;
        let mut remote = repo.find_remote(REMOTE_NAME)?;
        // A touched ref that no longer exists locally was deleted
        let deleted: Vec<bool> = refs
            .iter()
            .map(|r| repo.find_reference(r).is_err())
            .collect();
        let refspecs: Vec<String> = refs
            .iter()
            .zip(&deleted)
            .map(|(r, gone)| if *gone { format!(":{}", r) } else { format!("{}:{}", r, r) })
            .collect();

        let rejected: RefCell<Vec<String>> = RefCell::new(Vec::new());
        {
            let mut callbacks = remote_callbacks(repo.config().ok());
            callbacks.push_update_reference(|refname, status| {
                if let Some(message) = status {
                    rejected
                        .borrow_mut()
                        .push(format!("{} ({})", refname, message));
                }
                Ok(())
            });

            let mut push_options = PushOptions::new();
            push_options.remote_callbacks(callbacks);

            if let Err(e) = remote.push(&refspecs, Some(&mut push_options)) {
                if is_rejection(&e) {
                    return Err(SyncError::TransactionFailed {
                        message: e.message().to_string(),
                    });
                }
                return Err(e.into());
            }
        }

        let rejected = rejected.into_inner();
        if !rejected.is_empty() {
            return Err(SyncError::TransactionFailed {
                message: format!("rejected: {}", rejected.join(", ")),
            });
        }

        // Keep tracking refs in step so a reused copy is not considered ahead
        for (name, gone) in refs.iter().zip(deleted) {
            let tracking = match tracking_ref(name) {
                Some(tracking) => tracking,
                None => continue,
            };
            if gone {
                if let Ok(mut reference) = repo.find_reference(&tracking) {
                    reference.delete()?;
                }
            } else {
                let oid = repo.refname_to_id(name)?;
                repo.reference(&tracking, oid, true, "syncpoint: pushed")?;
            }
        }
        // Branches created in this transaction now have an upstream
        track_remote_branches(repo)?;

        Ok(())
    }

    /// Abandon the transaction without pushing anything
    pub fn abort(&mut self) -> Result<()> {
        self.expect_state(TransactionState::Active)?;
        self.discard_local_changes();
        self.repo = None;
        self.state.set(TransactionState::Aborted);
        tracing::debug!("Transaction aborted");
        Ok(())
    }

    fn discard_local_changes(&self) {
        let repo = match self.repo.as_ref() {
            Some(repo) => repo,
            None => return,
        };

        for name in self.touched.borrow().iter() {
            let result = match tracking_ref(name).and_then(|t| repo.refname_to_id(&t).ok()) {
                Some(oid) => repo
                    .reference(name, oid, true, "syncpoint: abort")
                    .map(|_| ()),
                None => repo.find_reference(name).and_then(|mut r| r.delete()),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to roll back {}: {}", name, e);
            }
        }
    }

    /// The local repository; only available while active
    pub fn repository(&self) -> Result<&Repository> {
        self.ensure_active()?;
        self.repo
            .as_ref()
            .ok_or(SyncError::InvalidTransactionState {
                expected: TransactionState::Active,
                actual: self.state.get(),
            })
    }

    /// Tip of a local branch, `None` if the branch does not exist
    pub fn branch_tip(&self, branch: &str) -> Result<Option<Oid>> {
        let repo = self.repository()?;
        match repo.refname_to_id(&branch_ref(branch)) {
            Ok(oid) => Ok(Some(oid)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Local branch names starting with `prefix`
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repository()?;
        let mut names = Vec::new();
        for item in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = item?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Point a local branch at `oid` and schedule it for push
    pub fn update_branch(&self, branch: &str, oid: Oid, message: &str) -> Result<()> {
        let repo = self.repository()?;
        let name = branch_ref(branch);
        repo.reference(&name, oid, true, message)?;
        self.touched.borrow_mut().insert(name);
        Ok(())
    }

    /// Delete a local branch and schedule the deletion for push
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repository()?;
        let name = branch_ref(branch);
        repo.find_reference(&name)?.delete()?;
        self.touched.borrow_mut().insert(name);
        Ok(())
    }

    /// Commit `tree` on top of `branch` (creating it when missing)
    pub fn commit_tree(&self, branch: &str, tree: Oid, message: &str) -> Result<Oid> {
        let repo = self.repository()?;
        let tree = repo.find_tree(tree)?;
        let parent: Option<Commit<'_>> = match self.branch_tip(branch)? {
            Some(oid) => Some(repo.find_commit(oid)?),
            None => None,
        };
        let parents: Vec<&Commit<'_>> = parent.iter().collect();

        let sig = Signature::now(AUTHOR_NAME, AUTHOR_EMAIL)?;
        let oid = repo.commit(None, &sig, &sig, message, &tree, &parents)?;
        self.update_branch(branch, oid, message)?;
        tracing::trace!("Committed {} on {}", oid, branch);
        Ok(oid)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.get() == TransactionState::Active {
            if let Err(e) = self.abort() {
                tracing::warn!("Failed to abort transaction on drop: {}", e);
            }
        }
    }
}

pub(crate) fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

fn tracking_ref(local_ref: &str) -> Option<String> {
    local_ref
        .strip_prefix("refs/heads/")
        .map(|name| format!("refs/remotes/{}/{}", REMOTE_NAME, name))
}

fn is_rejection(error: &git2::Error) -> bool {
    if error.code() == ErrorCode::NotFastForward {
        return true;
    }
    let msg = error.message().to_lowercase();
    msg.contains("non-fast-forward")
        || msg.contains("non-fastforwardable")
        || msg.contains("fetch first")
        || msg.contains("cannot lock ref")
        || msg.contains("failed to update ref")
        || msg.contains("failed to lock file")
}

pub(crate) fn remote_callbacks<'a>(config: Option<git2::Config>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_ssh_key() {
            if let Some(user) = username_from_url {
                return git2::Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(ref cfg) = config {
                if let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        git2::Cred::default()
    });
    callbacks
}

/// Give every remote branch a local branch tracking it
pub(crate) fn track_remote_branches(repo: &Repository) -> Result<()> {
    let prefix = format!("{}/", REMOTE_NAME);

    for item in repo.branches(Some(BranchType::Remote))? {
        let (remote_branch, _) = item?;
        let full_name = match remote_branch.name()? {
            Some(name) => name.to_string(),
            None => continue,
        };
        let local_name = match full_name.strip_prefix(&prefix) {
            Some(name) if name != "HEAD" => name.to_string(),
            _ => continue,
        };
        let target = match remote_branch.get().target() {
            Some(oid) => oid,
            None => continue,
        };

        let mut local = match repo.find_branch(&local_name, BranchType::Local) {
            Ok(branch) => branch,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let commit = repo.find_commit(target)?;
                tracing::trace!("Creating local branch {}", local_name);
                repo.branch(&local_name, &commit, false)?
            }
            Err(e) => return Err(e.into()),
        };

        if local.upstream().is_err() {
            local.set_upstream(Some(&full_name))?;
        }
    }

    Ok(())
}
