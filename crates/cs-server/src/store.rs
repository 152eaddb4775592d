//! Terminal and workstation persistence
//!
//! The registry never touches the disk itself. It talks to a
//! [`TerminalStore`], whose file-backed implementation hands the blocking
//! writes to the background [`WorkerPool`] and awaits their completion.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use cs_core::pool::{PoolError, WorkerPool};
use cs_core::types::{Terminal, TerminalId, Workstation, WorkstationId};

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Everything a store holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub terminals: Vec<Terminal>,
    #[serde(default)]
    pub workstations: Vec<Workstation>,
}

impl Snapshot {
    fn upsert_terminal(&mut self, terminal: &Terminal) {
        match self.terminals.iter_mut().find(|t| t.id == terminal.id) {
            Some(existing) => *existing = terminal.clone(),
            None => self.terminals.push(terminal.clone()),
        }
    }

    fn upsert_workstation(&mut self, workstation: &Workstation) {
        match self.workstations.iter_mut().find(|w| w.id == workstation.id) {
            Some(existing) => *existing = workstation.clone(),
            None => self.workstations.push(workstation.clone()),
        }
    }

    fn remove_terminal(&mut self, id: TerminalId) {
        self.terminals.retain(|t| t.id != id);
    }

    fn remove_workstation(&mut self, id: WorkstationId) {
        self.workstations.retain(|w| w.id != id);
    }
}

/// Durable storage for terminals and workstations
#[async_trait]
pub trait TerminalStore: Send + Sync {
    /// Read every persisted record
    async fn load(&self) -> Result<Snapshot, StoreError>;

    /// Insert or replace one terminal
    async fn save_terminal(&self, terminal: &Terminal) -> Result<(), StoreError>;

    /// Insert or replace one workstation
    async fn save_workstation(&self, workstation: &Workstation) -> Result<(), StoreError>;

    /// Delete one terminal
    async fn delete_terminal(&self, id: TerminalId) -> Result<(), StoreError>;

    /// Delete one workstation
    async fn delete_workstation(&self, id: WorkstationId) -> Result<(), StoreError>;
}

/// Store kept in memory only
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with records
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

#[async_trait]
impl TerminalStore for MemoryStore {
    async fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn save_terminal(&self, terminal: &Terminal) -> Result<(), StoreError> {
        self.snapshot.lock().await.upsert_terminal(terminal);
        Ok(())
    }

    async fn save_workstation(&self, workstation: &Workstation) -> Result<(), StoreError> {
        self.snapshot.lock().await.upsert_workstation(workstation);
        Ok(())
    }

    async fn delete_terminal(&self, id: TerminalId) -> Result<(), StoreError> {
        self.snapshot.lock().await.remove_terminal(id);
        Ok(())
    }

    async fn delete_workstation(&self, id: WorkstationId) -> Result<(), StoreError> {
        self.snapshot.lock().await.remove_workstation(id);
        Ok(())
    }
}

/// Store backed by one JSON file
///
/// The whole snapshot is rewritten on every change, through a temporary
/// file and a rename.
pub struct JsonFileStore {
    path: PathBuf,
    pool: Arc<WorkerPool>,
    /// Cached contents; the lock is held until the write lands
    snapshot: Mutex<Option<Snapshot>>,
}

impl JsonFileStore {
    /// Create a store for `path`; nothing is read until [`load`](TerminalStore::load)
    pub fn new(path: impl Into<PathBuf>, pool: Arc<WorkerPool>) -> Self {
        Self {
            path: path.into(),
            pool,
            snapshot: Mutex::new(None),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<Snapshot, StoreError> {
        let path = self.path.clone();
        self.pool.submit(move || read_snapshot(&path)).await?
    }

    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut cached = self.snapshot.lock().await;
        let mut snapshot = match cached.take() {
            Some(snapshot) => snapshot,
            None => self.read_file().await?,
        };
        change(&mut snapshot);

        let path = self.path.clone();
        let contents = snapshot.clone();
        let written = self
            .pool
            .submit(move || write_snapshot(&path, &contents))
            .await;

        // Keep the in-memory view even if the write failed; the next
        // change retries the full file
        *cached = Some(snapshot);
        written?
    }
}

#[async_trait]
impl TerminalStore for JsonFileStore {
    async fn load(&self) -> Result<Snapshot, StoreError> {
        let mut cached = self.snapshot.lock().await;
        let snapshot = self.read_file().await?;
        tracing::info!(
            "Loaded {} terminals and {} workstations from {:?}",
            snapshot.terminals.len(),
            snapshot.workstations.len(),
            self.path
        );
        *cached = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn save_terminal(&self, terminal: &Terminal) -> Result<(), StoreError> {
        self.update(|s| s.upsert_terminal(terminal)).await
    }

    async fn save_workstation(&self, workstation: &Workstation) -> Result<(), StoreError> {
        self.update(|s| s.upsert_workstation(workstation)).await
    }

    async fn delete_terminal(&self, id: TerminalId) -> Result<(), StoreError> {
        self.update(|s| s.remove_terminal(id)).await
    }

    async fn delete_workstation(&self, id: WorkstationId) -> Result<(), StoreError> {
        self.update(|s| s.remove_workstation(id)).await
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&content).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }

    let content = serde_json::to_vec_pretty(snapshot).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content).map_err(io_error)?;
    std::fs::rename(&tmp, path).map_err(io_error)?;
    Ok(())
}
