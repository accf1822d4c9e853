use crate::git::TransactionState;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid transaction state: expected {expected}, found {actual}")]
    InvalidTransactionState {
        expected: TransactionState,
        actual: TransactionState,
    },

    #[error("Failed to clone {remote} into {path}\nCause: {source}\nCheck that the remote exists and is reachable.")]
    Clone {
        remote: String,
        path: PathBuf,
        source: git2::Error,
    },

    #[error("Transaction failed: {message}\nThe remote changed since the transaction began. Retry against fresh remote state.")]
    TransactionFailed { message: String },

    #[error("Gave up after {0} rejected attempts\nOther replicas keep updating the shared history; try again later.")]
    TooManyRetries(usize),

    #[error("History not found: {name}")]
    HistoryNotFound { name: String },

    #[error("History already exists: {name}\nChoose a different folder name.")]
    DuplicateHistory { name: String },

    #[error("Snapshot not found: {id} in history {history}")]
    SnapshotNotFound { history: String, id: String },

    #[error("Snapshot set not found: {id}")]
    SnapshotSetNotFound { id: String },

    #[error("Snapshot {from} is not an ancestor of {to} in history {history}")]
    UnrelatedSnapshots {
        history: String,
        from: String,
        to: String,
    },

    #[error("Item not found: {key}")]
    ItemNotFound { key: String },

    #[error("Item already exists: {key}")]
    DuplicateItem { key: String },

    #[error("Invalid state transition for sync action {id}: {from} -> {to}")]
    InvalidStateTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Invalid change list: {0}")]
    InvalidChangeList(String),

    #[error("Invalid conflict: {0}")]
    InvalidConflict(String),

    #[error("Change graph error: {0}")]
    Graph(#[from] crate::graph::GraphError),

    #[error("Invalid name: {name}\nNames must be usable as a git branch component.")]
    InvalidName { name: String },

    #[error("Invalid path: {path}\nPaths must be valid UTF-8 and relative to the folder root.")]
    InvalidPath { path: PathBuf },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read directory: {path}\nCause: {source}\nCheck that the directory exists and you have read permissions.")]
    ReadDirError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors that go away when the whole transaction is retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransactionFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
