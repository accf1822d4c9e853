use super::FileReference;
use crate::error::{Result, SyncError};
use crate::path::RelativePath;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use std::path::PathBuf;

/// Walks a folder and reports the version of every regular file in it
pub struct Scanner {
    root: PathBuf,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn scan(&self) -> Result<Vec<FileReference>> {
        if !self.root.is_dir() {
            return Err(SyncError::ReadDirError {
                path: self.root.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "folder does not exist or is not a directory",
                ),
            });
        }

        let mut files = Vec::new();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)          // Don't skip hidden files by default
            .git_ignore(true)       // Respect .gitignore
            .git_global(true)       // Respect global gitignore
            .git_exclude(true)      // Respect .git/info/exclude
            .require_git(false)     // Folders are usually not repositories
            .filter_entry(|entry| entry.file_name() != ".git")
            .build();

        for result in walker {
            let entry = result.map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;

            let path = entry.path().to_path_buf();
            if path == self.root {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| SyncError::ReadDirError {
                path: path.clone(),
                source: std::io::Error::other(e.to_string()),
            })?;

            // Directories are implied by the files below them
            if !metadata.is_file() {
                continue;
            }

            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| SyncError::InvalidPath { path: path.clone() })?;
            let modified = metadata.modified().map_err(|e| SyncError::ReadDirError {
                path: path.clone(),
                source: e,
            })?;

            files.push(FileReference::new(
                RelativePath::from_path(relative)?,
                DateTime::<Utc>::from(modified),
                metadata.len(),
            ));
        }

        tracing::debug!("Scanned {} file(s) in {}", files.len(), self.root.display());
        Ok(files)
    }
}
