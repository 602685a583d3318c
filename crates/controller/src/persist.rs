//! Durable marker records. Each marker is a small JSON file overwritten
//! atomically (write to a temp file, fsync, rename) so a crash mid-write
//! leaves either the old record or the new one, never a torn file.
//!
//! A missing or malformed record reads as `T::default()` — the safe "no
//! prior state" interpretation — with a warning, never an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write marker file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode marker: {0}")]
    Encode(#[from] serde_json::Error),
}

/// File-backed store for a single marker record of type `T`.
pub struct MarkerStore<T> {
    path: PathBuf,
    _record: PhantomData<T>,
}

impl<T> MarkerStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the marker. Missing or corrupt records degrade to the default.
    pub fn load(&self) -> T {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return T::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "marker unreadable, assuming no prior state: {e}");
                return T::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), "marker corrupt, assuming no prior state: {e}");
                T::default()
            }
        }
    }

    /// Overwrite the marker durably. The record must be on disk before the
    /// caller asserts any physical output that depends on it.
    pub fn save(&self, record: &T) -> Result<(), PersistError> {
        let payload = serde_json::to_vec(record)?;
        let tmp = self.path.with_extension("tmp");

        let io_err = |source| PersistError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(io_err)?;
            }
        }

        let mut f = File::create(&tmp).map_err(io_err)?;
        f.write_all(&payload).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
