//! Session registry
//!
//! The registry is the only owner of [`IceSession`]s. Sessions are addressed
//! by their stable [`IceSessionId`]; engine callbacks find them through a
//! secondary index keyed by engine session handle. Removing a session from
//! the registry is the only way it is dropped.

use std::collections::HashMap;

use tracing::debug;

use crate::engine::EngineSessionId;
use crate::error::{IceError, Result};
use crate::session::IceSession;
use crate::session::IceSessionId;

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_created: usize,
    pub total_ended: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    sessions: HashMap<IceSessionId, IceSession>,
    by_handle: HashMap<EngineSessionId, IceSessionId>,
    total_created: usize,
    total_ended: usize,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, session: IceSession) -> IceSessionId {
        let id = session.id();
        if let Some(handle) = session.engine_handle() {
            self.by_handle.insert(handle, id);
        }
        self.sessions.insert(id, session);
        self.total_created += 1;
        debug!("Registered ICE session {}", id);
        id
    }

    pub(crate) fn get(&self, id: &IceSessionId) -> Result<&IceSession> {
        self.sessions.get(id).ok_or_else(|| IceError::session_not_found(id))
    }

    pub(crate) fn get_mut(&mut self, id: &IceSessionId) -> Result<&mut IceSession> {
        self.sessions.get_mut(id).ok_or_else(|| IceError::session_not_found(id))
    }

    /// Session currently bound to an engine handle
    pub(crate) fn by_handle_mut(&mut self, handle: EngineSessionId) -> Option<&mut IceSession> {
        let id = self.by_handle.get(&handle)?;
        self.sessions.get_mut(id)
    }

    /// Point the handle index at a session's new engine handle
    pub(crate) fn rebind(&mut self, id: IceSessionId, old: Option<EngineSessionId>, new: Option<EngineSessionId>) {
        if let Some(old) = old {
            self.by_handle.remove(&old);
        }
        if let Some(new) = new {
            self.by_handle.insert(new, id);
        }
    }

    pub(crate) fn remove(&mut self, id: &IceSessionId) -> Result<IceSession> {
        let session = self.sessions.remove(id).ok_or_else(|| IceError::session_not_found(id))?;
        self.by_handle.retain(|_, owner| owner != id);
        self.total_ended += 1;
        debug!("Unregistered ICE session {}", id);
        Ok(session)
    }

    /// Related sessions borrowing `parent`'s engine state
    pub(crate) fn children_of(&self, parent: IceSessionId) -> Vec<IceSessionId> {
        self.sessions
            .values()
            .filter(|s| s.parent() == Some(parent))
            .map(|s| s.id())
            .collect()
    }

    pub(crate) fn ids(&self) -> Vec<IceSessionId> {
        self.sessions.keys().copied().collect()
    }

    pub(crate) fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_created: self.total_created,
            total_ended: self.total_ended,
            active: self.sessions.len(),
        }
    }
}
