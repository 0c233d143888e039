use std::{collections::HashMap, sync::Arc};

use mtls_relay_common::CorrelationId;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::{error::RelayError, session::SessionState};

/// Owned handle to one live streaming session.
#[derive(Debug)]
pub struct SessionHandle {
    generation: Uuid,
    state:      SessionState,
    abort:      AbortHandle,
}

impl SessionHandle {
    /// Wrap the task driving a session. A fresh generation token is drawn so
    /// the entry can be told apart from any later session under the same id.
    pub fn new(abort: AbortHandle) -> Self {
        Self {
            generation: Uuid::new_v4(),
            state: SessionState::Connecting,
            abort,
        }
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn terminate(&self) {
        self.abort.abort();
    }
}

/// Live streaming sessions keyed by correlation id.
///
/// At most one session is registered per id. Every operation takes the lock
/// once, so a close racing with a terminating connection sees either the
/// entry or its absence, never a half-removed state.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<CorrelationId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under `id` and return its generation.
    ///
    /// A session already registered under `id` is terminated and replaced.
    pub fn insert(&self, id: CorrelationId, handle: SessionHandle) -> Uuid {
        let generation = handle.generation;
        let previous = self.sessions.lock().insert(id.clone(), handle);
        if let Some(previous) = previous {
            tracing::warn!("Session {} replaced by a new session with the same id", id);
            previous.terminate();
        }
        generation
    }

    /// Remove the entry for `id` without touching its connection.
    pub fn remove(&self, id: &CorrelationId) -> Option<SessionHandle> {
        self.sessions.lock().remove(id)
    }

    /// Remove the entry for `id` only if it still belongs to `generation`.
    ///
    /// Returns `false` when the id is absent or now belongs to a newer session.
    pub fn remove_if_current(&self, id: &CorrelationId, generation: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(handle) if handle.generation == generation => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, id: &CorrelationId, generation: Uuid) -> bool {
        self.sessions
            .lock()
            .get(id)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Record a state transition for the session of `generation`.
    ///
    /// Ignored if that session is no longer registered. `Closed` is terminal.
    pub fn set_state(&self, id: &CorrelationId, generation: Uuid, state: SessionState) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(handle) if handle.generation == generation && handle.state != SessionState::Closed => {
                handle.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, id: &CorrelationId) -> Option<SessionState> {
        self.sessions.lock().get(id).map(SessionHandle::state)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Forcibly terminate the session under `id` and remove it.
    /// Terminate a live session. A session already closed by its remote end
    /// counts as not open, even before its entry is dropped.
    pub fn close(&self, id: &CorrelationId) -> Result<(), RelayError> {
        let handle = {
            let mut sessions = self.sessions.lock();
            match sessions.get(id) {
                Some(handle) if handle.state != SessionState::Closed => sessions.remove(id),
                _ => None,
            }
        }
        .ok_or_else(|| RelayError::SessionNotFound(id.clone()))?;
        handle.terminate();
        tracing::info!("Session {} closed", id);
        Ok(())
    }

    /// Terminate every live session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().drain().collect();
        for (id, handle) in &drained {
            handle.terminate();
            tracing::debug!("Session {} terminated", id);
        }
        drained.len()
    }
}
