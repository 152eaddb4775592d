//! Persisted terminal identity
//!
//! The server assigns each terminal an id on first contact; the daemon
//! keeps it in a small JSON file so the same workstation reports the same
//! id after restarts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use cs_core::types::TerminalId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access identity file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityRecord {
    terminal_id: Option<TerminalId>,
}

/// File-backed identity slot
///
/// The file is read once on first use and cached afterwards.
#[derive(Debug)]
pub struct IdentityStore {
    path: PathBuf,
    cached: Mutex<Option<Option<TerminalId>>>,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored identity; a missing file means none
    pub async fn load(&self) -> Result<Option<TerminalId>, IdentityError> {
        let mut cached = self.cached.lock().await;
        if let Some(id) = *cached {
            return Ok(id);
        }

        let id = match tokio::fs::read(&self.path).await {
            Ok(raw) => {
                let record: IdentityRecord =
                    serde_json::from_slice(&raw).map_err(|source| IdentityError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })?;
                record.terminal_id
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(IdentityError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        *cached = Some(id);
        Ok(id)
    }

    /// Store the identity handed out by the server
    pub async fn assign(&self, id: TerminalId) -> Result<(), IdentityError> {
        let mut cached = self.cached.lock().await;
        let io_error = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let record = IdentityRecord {
            terminal_id: Some(id),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|source| IdentityError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;

        tracing::info!("Stored terminal identity {} in {:?}", id, self.path);
        *cached = Some(Some(id));
        Ok(())
    }
}
