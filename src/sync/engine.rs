use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::git::Transaction;
use std::time::Instant;

/// Runs units of work in transactions, retrying when the push is rejected
pub struct SyncEngine {
    config: StoreConfig,
}

impl SyncEngine {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Begin a transaction, run `work` in it and commit
    ///
    /// When another replica pushed first, the whole unit is repeated against
    /// the fresh remote state, at most `max_retries` times. Any other error
    /// aborts the transaction and is returned as is.
    pub fn run<T>(&self, mut work: impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let mut retries = 0;

        loop {
            let attempt = retries + 1;
            tracing::debug!(attempt, "Transaction attempt");

            match self.attempt(&mut work) {
                Ok(value) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(elapsed_ms, retries, "Transaction committed");
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        tracing::warn!(elapsed_ms, retries, "Transaction retry limit exceeded");
                        return Err(SyncError::TooManyRetries(retries));
                    }
                    tracing::info!("Remote changed during transaction, retrying ({})", e);
                }
                Err(e) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(elapsed_ms, retries, error = %e, "Transaction failed");
                    return Err(e);
                }
            }
        }
    }

    fn attempt<T>(&self, work: &mut impl FnMut(&Transaction) -> Result<T>) -> Result<T> {
        let mut tx = Transaction::from_config(&self.config);
        tx.begin()?;
        // An error here drops the active transaction, which aborts it
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::TransactionState;
    use git2::Repository;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn config(temp: &TempDir, max_retries: usize) -> StoreConfig {
        let remote = temp.path().join("remote.git");
        Repository::init_bare(&remote).unwrap();
        StoreConfig {
            remote: remote.to_str().unwrap().to_string(),
            working_copy: temp.path().join("working-copy"),
            reuse_working_copy: true,
            max_retries,
        }
    }

    #[test]
    fn test_run_commits_work() {
        let temp = TempDir::new().unwrap();
        let engine = SyncEngine::new(config(&temp, 3));

        let state = engine
            .run(|tx| {
                let tree = tx.repository()?.treebuilder(None)?.write()?;
                tx.commit_tree("notes", tree, "note")?;
                Ok(tx.state())
            })
            .unwrap();
        assert_eq!(state, TransactionState::Active);

        let remote = Repository::open_bare(&engine.config().remote).unwrap();
        assert!(remote.refname_to_id("refs/heads/notes").is_ok());
    }

    #[test]
    fn test_run_retries_rejected_transactions() {
        let temp = TempDir::new().unwrap();
        let engine = SyncEngine::new(config(&temp, 2));
        let calls = Cell::new(0);

        let result: Result<()> = engine.run(|_| {
            calls.set(calls.get() + 1);
            Err(SyncError::TransactionFailed {
                message: "rejected".to_string(),
            })
        });

        assert!(matches!(result, Err(SyncError::TooManyRetries(3))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_run_does_not_retry_other_errors() {
        let temp = TempDir::new().unwrap();
        let engine = SyncEngine::new(config(&temp, 5));
        let calls = Cell::new(0);

        let result: Result<()> = engine.run(|_| {
            calls.set(calls.get() + 1);
            Err(SyncError::HistoryNotFound {
                name: "docs".to_string(),
            })
        });

        assert!(matches!(result, Err(SyncError::HistoryNotFound { .. })));
        assert_eq!(calls.get(), 1);
    }
}
