// Library exports for integration tests and embedding

pub mod config;
pub mod diff;
pub mod error;
pub mod git;
pub mod graph;
pub mod history;
pub mod path;
pub mod sync;

pub use error::{Result, SyncError};
