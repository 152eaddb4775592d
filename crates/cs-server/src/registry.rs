//! Terminal registry
//!
//! Maps terminal ids to their records, online status and remote-call link.
//! Identities are handed out on first contact; every change is persisted
//! through the [`TerminalStore`] and published on the event bus in
//! subscription order.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use cs_core::error::StateError;
use cs_core::rpc::ops::{AssignIdentity, GetIdentity};
use cs_core::rpc::{AdminError, RpcChannel, RpcError, TerminalInfo};
use cs_core::types::{SessionHandle, Terminal, TerminalId, Workstation, WorkstationId};

use crate::store::{StoreError, TerminalStore};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle events published by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    TerminalAdded(TerminalId),
    TerminalRemoved(TerminalId),
    TerminalStatusChanged { id: TerminalId, online: bool },
    WorkstationAdded(WorkstationId),
    WorkstationRemoved(WorkstationId),
}

/// Registry failures
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Identity handshake failed: {0}")]
    Handshake(#[from] RpcError<Infallible>),

    #[error("No such terminal: {0}")]
    NoSuchTerminal(TerminalId),

    #[error("No such workstation: {0}")]
    NoSuchWorkstation(WorkstationId),
}

#[derive(Default)]
struct Inner {
    terminals: BTreeMap<TerminalId, Terminal>,
    workstations: BTreeMap<WorkstationId, Workstation>,
    links: HashMap<TerminalId, RpcChannel>,
}

impl Inner {
    fn bound_to(&self, session: SessionHandle) -> Option<TerminalId> {
        self.terminals
            .values()
            .find(|t| t.session == Some(session))
            .map(|t| t.id)
    }
}

/// Server-side table of terminals
pub struct TerminalRegistry {
    store: Arc<dyn TerminalStore>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl TerminalRegistry {
    /// Load every persisted record; all terminals start offline
    pub async fn load(store: Arc<dyn TerminalStore>) -> Result<Self, StoreError> {
        let snapshot = store.load().await?;

        let mut inner = Inner::default();
        for mut terminal in snapshot.terminals {
            terminal.session = None;
            inner.terminals.insert(terminal.id, terminal);
        }
        for workstation in snapshot.workstations {
            inner.workstations.insert(workstation.id, workstation);
        }
        tracing::info!(
            "Registry holds {} terminals and {} workstations",
            inner.terminals.len(),
            inner.workstations.len()
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            store,
            inner: Mutex::new(inner),
            events,
        })
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        tracing::debug!("Registry event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Identify a freshly connected terminal and bind it to `session`
    ///
    /// Asks the peer for its stored id; an absent or unknown id gets a new
    /// terminal, which is persisted and then assigned to the peer.
    pub async fn attach_client(
        &self,
        session: SessionHandle,
        link: RpcChannel,
    ) -> Result<TerminalId, RegistryError> {
        let reported = link.call::<GetIdentity>(()).await?;

        let known = match reported {
            Some(id) => self.inner.lock().await.terminals.contains_key(&id),
            None => false,
        };

        let id = match reported {
            Some(id) if known => id,
            _ => {
                if let Some(id) = reported {
                    tracing::warn!("{} reported unknown terminal id {}", session, id);
                }
                let terminal = self.create_terminal().await?;
                link.call::<AssignIdentity>(terminal.id).await?;
                terminal.id
            }
        };

        {
            let mut inner = self.inner.lock().await;
            if link.is_closed() {
                return Err(RpcError::<Infallible>::Closed.into());
            }
            if let Some(bound) = inner.bound_to(session) {
                let err = StateError::SessionAlreadyBound(session, bound);
                tracing::error!("{}", err);
                return Err(err.into());
            }
            let terminal = inner
                .terminals
                .get_mut(&id)
                .ok_or(RegistryError::NoSuchTerminal(id))?;
            if terminal.is_online() {
                let err = StateError::AlreadyOnline(id);
                tracing::error!("{} rejected: {}", session, err);
                return Err(err.into());
            }
            terminal.session = Some(session);
            inner.links.insert(id, link);
        }

        tracing::info!("Terminal {} is online ({})", id, session);
        self.publish(RegistryEvent::TerminalStatusChanged { id, online: true });
        Ok(id)
    }

    /// Unbind whatever terminal holds `session`
    pub async fn detach_client(&self, session: SessionHandle) -> Result<TerminalId, StateError> {
        let id = {
            let mut inner = self.inner.lock().await;
            let Some(id) = inner.bound_to(session) else {
                let err = StateError::NotBound(session);
                tracing::error!("{}", err);
                return Err(err);
            };
            if let Some(terminal) = inner.terminals.get_mut(&id) {
                terminal.session = None;
            }
            inner.links.remove(&id);
            id
        };

        tracing::info!("Terminal {} is offline", id);
        self.publish(RegistryEvent::TerminalStatusChanged { id, online: false });
        Ok(id)
    }

    async fn create_terminal(&self) -> Result<Terminal, RegistryError> {
        let terminal = {
            let mut inner = self.inner.lock().await;
            let next = inner
                .terminals
                .keys()
                .next_back()
                .map_or(0, |id| id.as_u32())
                + 1;
            let terminal = Terminal::new(TerminalId::new(next));
            // Persisted before it becomes visible
            self.store.save_terminal(&terminal).await?;
            inner.terminals.insert(terminal.id, terminal.clone());
            terminal
        };

        tracing::info!("Created terminal {} ({})", terminal.id, terminal.name);
        self.publish(RegistryEvent::TerminalAdded(terminal.id));
        Ok(terminal)
    }

    /// Ids of every known terminal, ascending
    pub async fn terminal_ids(&self) -> Vec<TerminalId> {
        self.inner.lock().await.terminals.keys().copied().collect()
    }

    /// A copy of one terminal record
    pub async fn terminal(&self, id: TerminalId) -> Option<Terminal> {
        self.inner.lock().await.terminals.get(&id).cloned()
    }

    /// Name and online flag of one terminal
    pub async fn terminal_info(&self, id: TerminalId) -> Result<TerminalInfo, AdminError> {
        let inner = self.inner.lock().await;
        let terminal = inner.terminals.get(&id).ok_or(AdminError::NoSuchObject)?;
        Ok(TerminalInfo {
            name: terminal.name.clone(),
            online: terminal.is_online(),
        })
    }

    /// Remote-call link of an online terminal
    pub async fn client_link(&self, id: TerminalId) -> Result<RpcChannel, AdminError> {
        let inner = self.inner.lock().await;
        if !inner.terminals.contains_key(&id) {
            return Err(AdminError::NoSuchObject);
        }
        inner.links.get(&id).cloned().ok_or(AdminError::TerminalOffline)
    }

    /// Delete an offline terminal
    pub async fn remove_terminal(&self, id: TerminalId) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock().await;
            let terminal = inner
                .terminals
                .get(&id)
                .ok_or(RegistryError::NoSuchTerminal(id))?;
            if terminal.is_online() {
                return Err(StateError::TerminalOnline(id).into());
            }

            self.store.delete_terminal(id).await?;
            inner.terminals.remove(&id);

            let released: Vec<Workstation> = inner
                .workstations
                .values_mut()
                .filter(|w| w.terminal_id == Some(id))
                .map(|w| {
                    w.terminal_id = None;
                    w.clone()
                })
                .collect();
            for workstation in &released {
                self.store.save_workstation(workstation).await?;
            }
        }

        tracing::info!("Removed terminal {}", id);
        self.publish(RegistryEvent::TerminalRemoved(id));
        Ok(())
    }

    /// Create and persist a workstation
    pub async fn create_workstation(&self, name: &str) -> Result<Workstation, RegistryError> {
        let workstation = {
            let mut inner = self.inner.lock().await;
            let next = inner
                .workstations
                .keys()
                .next_back()
                .map_or(0, |id| id.0)
                + 1;
            let workstation = Workstation {
                id: WorkstationId(next),
                name: name.to_string(),
                terminal_id: None,
            };
            self.store.save_workstation(&workstation).await?;
            inner.workstations.insert(workstation.id, workstation.clone());
            workstation
        };

        tracing::info!("Created workstation {} ({})", workstation.id, workstation.name);
        self.publish(RegistryEvent::WorkstationAdded(workstation.id));
        Ok(workstation)
    }

    /// Delete a workstation, releasing the terminal bound to it
    pub async fn remove_workstation(&self, id: WorkstationId) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.lock().await;
            let bound = inner
                .workstations
                .get(&id)
                .ok_or(RegistryError::NoSuchWorkstation(id))?
                .terminal_id;

            if let Some(terminal) = bound.and_then(|t| inner.terminals.get_mut(&t)) {
                terminal.workstation_id = None;
                let released = terminal.clone();
                self.store.save_terminal(&released).await?;
            }

            self.store.delete_workstation(id).await?;
            inner.workstations.remove(&id);
        }

        tracing::info!("Removed workstation {}", id);
        self.publish(RegistryEvent::WorkstationRemoved(id));
        Ok(())
    }

    /// All workstations, by id
    pub async fn workstations(&self) -> Vec<Workstation> {
        self.inner.lock().await.workstations.values().cloned().collect()
    }

    /// Bind a terminal to a workstation, releasing any previous partner of either
    pub async fn assign_workstation(
        &self,
        terminal_id: TerminalId,
        workstation_id: WorkstationId,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;
        if !inner.terminals.contains_key(&terminal_id) {
            return Err(RegistryError::NoSuchTerminal(terminal_id));
        }
        if !inner.workstations.contains_key(&workstation_id) {
            return Err(RegistryError::NoSuchWorkstation(workstation_id));
        }

        let mut touched_terminals = Vec::new();
        let mut touched_workstations = Vec::new();

        // Old workstation of this terminal
        let old_workstation = inner
            .terminals
            .get(&terminal_id)
            .and_then(|t| t.workstation_id)
            .filter(|w| *w != workstation_id);
        if let Some(old) = old_workstation.and_then(|w| inner.workstations.get_mut(&w)) {
            old.terminal_id = None;
            touched_workstations.push(old.clone());
        }

        // Old terminal of this workstation
        let old_terminal = inner
            .workstations
            .get(&workstation_id)
            .and_then(|w| w.terminal_id)
            .filter(|t| *t != terminal_id);
        if let Some(old) = old_terminal.and_then(|t| inner.terminals.get_mut(&t)) {
            old.workstation_id = None;
            touched_terminals.push(old.clone());
        }

        if let Some(terminal) = inner.terminals.get_mut(&terminal_id) {
            terminal.workstation_id = Some(workstation_id);
            touched_terminals.push(terminal.clone());
        }
        if let Some(workstation) = inner.workstations.get_mut(&workstation_id) {
            workstation.terminal_id = Some(terminal_id);
            touched_workstations.push(workstation.clone());
        }

        for terminal in &touched_terminals {
            self.store.save_terminal(terminal).await?;
        }
        for workstation in &touched_workstations {
            self.store.save_workstation(workstation).await?;
        }

        tracing::info!("Terminal {} assigned to workstation {}", terminal_id, workstation_id);
        Ok(())
    }
}
