// Per-path change computation between snapshots of one folder

pub mod change;
pub mod compute;

pub use change::{Change, ChangeList, ChangeType};
pub use compute::compute_changes;

use crate::history::FileReference;
use std::time::Duration;

/// Equality policy for values compared during diffing and graph merging
pub trait Equivalence<T: ?Sized> {
    fn equivalent(&self, a: &T, b: &T) -> bool;
}

impl<T: ?Sized, E: Equivalence<T> + ?Sized> Equivalence<T> for &E {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        (**self).equivalent(a, b)
    }
}

/// File versions are equal when path (ignoring case), length and
/// modification time agree
///
/// Filesystems and copy tools round modification times differently, so a
/// tolerance can be configured. The default is exact comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataEquality {
    mtime_tolerance: Duration,
}

impl MetadataEquality {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tolerance(mtime_tolerance: Duration) -> Self {
        Self { mtime_tolerance }
    }

    fn mtime_matches(&self, a: &FileReference, b: &FileReference) -> bool {
        let delta = (a.last_write_time - b.last_write_time).abs();
        match delta.to_std() {
            Ok(delta) => delta <= self.mtime_tolerance,
            Err(_) => false,
        }
    }
}

impl Equivalence<FileReference> for MetadataEquality {
    fn equivalent(&self, a: &FileReference, b: &FileReference) -> bool {
        a.path == b.path && a.length == b.length && self.mtime_matches(a, b)
    }
}

/// Lifts a policy to optional values; `None` (absent file) only equals `None`
#[derive(Debug, Clone, Copy)]
pub struct Optional<E>(pub E);

impl<T, E: Equivalence<T>> Equivalence<Option<T>> for Optional<E> {
    fn equivalent(&self, a: &Option<T>, b: &Option<T>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => self.0.equivalent(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}
