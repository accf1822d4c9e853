// Transactional access to the shared history repository
//
// A transaction clones (or safely reuses) a bare local copy of the remote,
// lets services mutate local branches, and pushes every touched branch on
// commit. The remote's conditional ref update is the only concurrency
// control: a push that is not a fast-forward fails the transaction.

pub mod caching;
pub mod transaction;

pub use caching::{RecloneReason, ReuseDecision};
pub use transaction::{CloneStrategy, Transaction, TransactionState};
