//! Active index persistence
//!
//! A single text file holding the decimal index of the last active station.
//! Reads never fail the caller: anything unusable falls back to index 0.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct IndexFile {
    path: PathBuf,
}

impl IndexFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted index, returning 0 when the file is missing,
    /// unreadable, non-numeric, negative, or not below `station_count`
    pub fn load(&self, station_count: usize) -> usize {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::info!(
                    "Could not read state file {}, starting from index 0: {}",
                    self.path.display(),
                    e
                );
                return 0;
            }
        };

        match content.trim().parse::<i64>() {
            Ok(index) if index >= 0 && (index as u64) < station_count as u64 => {
                tracing::info!("Loaded current station index: {}", index);
                index as usize
            }
            _ => {
                tracing::warn!(
                    "Invalid index found in {} ({:?}), starting from index 0",
                    self.path.display(),
                    content
                );
                0
            }
        }
    }

    pub async fn save(&self, index: usize) -> Result<(), PersistenceError> {
        let to_err = |source| PersistenceError::Write {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
            }
        }
        tokio::fs::write(&self.path, index.to_string())
            .await
            .map_err(to_err)
    }
}
