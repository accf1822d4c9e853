// Working copy reuse
//
// A cached working copy saves a full clone per transaction, but only when it
// cannot leak state: it must point at the same remote, carry no local-only
// branches and no unpushed commits. Anything doubtful means delete and clone.

use super::transaction::{remote_callbacks, track_remote_branches, FETCH_REFSPEC, REMOTE_NAME};
use git2::{BranchType, FetchOptions, FetchPrune, Oid, Repository};
use std::path::Path;

/// Outcome of inspecting a cached working copy
pub enum ReuseDecision {
    Reuse(Repository),
    Reclone(RecloneReason),
}

/// Why a cached working copy cannot be reused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecloneReason {
    Missing,
    Empty,
    NotARepository(String),
    NotBare,
    RemoteMismatch { expected: String, actual: Option<String> },
    FetchFailed(String),
    UntrackedBranch(String),
    BranchAhead { branch: String, commits: usize },
    Git(String),
}

impl std::fmt::Display for RecloneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecloneReason::Missing => write!(f, "working copy does not exist"),
            RecloneReason::Empty => write!(f, "working copy is empty"),
            RecloneReason::NotARepository(e) => write!(f, "not a repository ({})", e),
            RecloneReason::NotBare => write!(f, "working copy is not a bare repository"),
            RecloneReason::RemoteMismatch { expected, actual } => write!(
                f,
                "remote mismatch (expected {}, found {})",
                expected,
                actual.as_deref().unwrap_or("none")
            ),
            RecloneReason::FetchFailed(e) => write!(f, "fetch failed ({})", e),
            RecloneReason::UntrackedBranch(b) => {
                write!(f, "branch {} does not track a remote branch", b)
            }
            RecloneReason::BranchAhead { branch, commits } => {
                write!(f, "branch {} has {} unpushed commit(s)", branch, commits)
            }
            RecloneReason::Git(e) => write!(f, "git error ({})", e),
        }
    }
}

impl From<git2::Error> for RecloneReason {
    fn from(e: git2::Error) -> Self {
        RecloneReason::Git(e.message().to_string())
    }
}

/// Decide whether the working copy at `path` can serve a transaction
/// against `remote_url`
///
/// On success the copy has been fetched, branches that were behind are
/// fast-forwarded, and new remote branches have local counterparts.
pub fn check_working_copy(path: &Path, remote_url: &str) -> ReuseDecision {
    match inspect(path, remote_url) {
        Ok(repo) => ReuseDecision::Reuse(repo),
        Err(reason) => ReuseDecision::Reclone(reason),
    }
}

fn inspect(path: &Path, remote_url: &str) -> Result<Repository, RecloneReason> {
    let mut entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return Err(RecloneReason::Missing),
    };
    if entries.next().is_none() {
        return Err(RecloneReason::Empty);
    }

    let repo = Repository::open(path)
        .map_err(|e| RecloneReason::NotARepository(e.message().to_string()))?;
    if !repo.is_bare() {
        return Err(RecloneReason::NotBare);
    }

    {
        let remote = repo.find_remote(REMOTE_NAME).ok();
        let actual = remote.as_ref().and_then(|r| r.url()).map(str::to_string);
        if actual.as_deref() != Some(remote_url) {
            return Err(RecloneReason::RemoteMismatch {
                expected: remote_url.to_string(),
                actual,
            });
        }
    }

    // Local-only branches would be silently dropped by the next push
    for (name, _) in local_branches(&repo)? {
        let branch = repo.find_branch(&name, BranchType::Local)?;
        if branch.upstream().is_err() {
            return Err(RecloneReason::UntrackedBranch(name));
        }
    }

    fetch(&repo)?;

    let mut behind = Vec::new();
    for (name, local_oid) in local_branches(&repo)? {
        let branch = repo.find_branch(&name, BranchType::Local)?;
        let upstream_oid = match branch.upstream() {
            Ok(upstream) => upstream.get().target(),
            // Pruned by the fetch: the remote deleted the branch
            Err(_) => return Err(RecloneReason::UntrackedBranch(name)),
        };
        let upstream_oid = match upstream_oid {
            Some(oid) => oid,
            None => return Err(RecloneReason::UntrackedBranch(name)),
        };

        let (ahead, behind_by) = repo.graph_ahead_behind(local_oid, upstream_oid)?;
        if ahead > 0 {
            return Err(RecloneReason::BranchAhead {
                branch: name,
                commits: ahead,
            });
        }
        if behind_by > 0 {
            behind.push((name, upstream_oid));
        }
    }

    for (name, oid) in behind {
        tracing::debug!("Fast-forwarding {} to {}", name, oid);
        let mut branch = repo.find_branch(&name, BranchType::Local)?;
        branch.get_mut().set_target(oid, "syncpoint: fast-forward")?;
    }

    track_remote_branches(&repo).map_err(|e| RecloneReason::Git(e.to_string()))?;

    Ok(repo)
}

fn local_branches(repo: &Repository) -> Result<Vec<(String, Oid)>, RecloneReason> {
    let mut branches = Vec::new();
    for item in repo.branches(Some(BranchType::Local))? {
        let (branch, _) = item?;
        let name = match branch.name()? {
            Some(name) => name.to_string(),
            None => continue,
        };
        if let Some(oid) = branch.get().target() {
            branches.push((name, oid));
        }
    }
    Ok(branches)
}

fn fetch(repo: &Repository) -> Result<(), RecloneReason> {
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(repo.config().ok()));
    fetch_options.prune(FetchPrune::On);
    remote
        .fetch(&[FETCH_REFSPEC], Some(&mut fetch_options), None)
        .map_err(|e| RecloneReason::FetchFailed(e.message().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path() {
        let temp = TempDir::new().unwrap();
        match check_working_copy(&temp.path().join("nope"), "/remote") {
            ReuseDecision::Reclone(reason) => assert_eq!(reason, RecloneReason::Missing),
            ReuseDecision::Reuse(_) => panic!("missing path must not be reused"),
        }
    }

    #[test]
    fn test_empty_path() {
        let temp = TempDir::new().unwrap();
        match check_working_copy(temp.path(), "/remote") {
            ReuseDecision::Reclone(reason) => assert_eq!(reason, RecloneReason::Empty),
            ReuseDecision::Reuse(_) => panic!("empty path must not be reused"),
        }
    }

    #[test]
    fn test_not_a_repository() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("file.txt"), "content").unwrap();
        match check_working_copy(temp.path(), "/remote") {
            ReuseDecision::Reclone(RecloneReason::NotARepository(_)) => {}
            ReuseDecision::Reclone(other) => panic!("unexpected reason: {}", other),
            ReuseDecision::Reuse(_) => panic!("plain directory must not be reused"),
        }
    }

    #[test]
    fn test_non_bare_repository() {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();
        match check_working_copy(temp.path(), "/remote") {
            ReuseDecision::Reclone(reason) => assert_eq!(reason, RecloneReason::NotBare),
            ReuseDecision::Reuse(_) => panic!("non-bare repository must not be reused"),
        }
    }

    #[test]
    fn test_remote_mismatch() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init_bare(temp.path()).unwrap();
        repo.remote("origin", "/somewhere/else").unwrap();
        match check_working_copy(temp.path(), "/remote") {
            ReuseDecision::Reclone(RecloneReason::RemoteMismatch { actual, .. }) => {
                assert_eq!(actual.as_deref(), Some("/somewhere/else"));
            }
            ReuseDecision::Reclone(other) => panic!("unexpected reason: {}", other),
            ReuseDecision::Reuse(_) => panic!("foreign remote must not be reused"),
        }
    }

    #[test]
    fn test_reason_display() {
        let reason = RecloneReason::BranchAhead {
            branch: "history/docs".to_string(),
            commits: 2,
        };
        assert_eq!(
            reason.to_string(),
            "branch history/docs has 2 unpushed commit(s)"
        );
    }
}
