//! Live session registry: late attach and cancellation.
//!
//! Each running session owns a broadcast channel of progress events that any
//! number of observers can attach to mid-flight, and a watch flag the
//! pipeline polls between chunks to stop cleanly.

use super::{IndexingSession, SessionKey, SessionStatus};
use crate::pipeline::ProgressEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Events buffered for observers that attach late or read slowly.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session {key} is already active")]
    AlreadyActive { key: SessionKey },
    #[error("no session registered for {key}")]
    NotFound { key: SessionKey },
}

/// A registered session plus its control channels.
pub struct SessionHandle {
    pub session: Arc<IndexingSession>,
    events: broadcast::Sender<ProgressEvent>,
    cancel: watch::Sender<bool>,
}

impl SessionHandle {
    fn new(session: Arc<IndexingSession>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (cancel, _) = watch::channel(false);
        Self {
            session,
            events,
            cancel,
        }
    }

    /// Attach an observer; it sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn events_sender(&self) -> broadcast::Sender<ProgressEvent> {
        self.events.clone()
    }

    /// Flag checked by the pipeline between chunks.
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn cancel(&self) {
        tracing::info!(session = %self.session.key, "session cancelled");
        self.session.set_status(SessionStatus::Cancelled);
        self.cancel.send_replace(true);
    }
}

/// All sessions known to this process.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A key already running is an error; a finished
    /// session under the same key is replaced.
    pub fn create(
        &self,
        session: Arc<IndexingSession>,
    ) -> Result<Arc<SessionHandle>, RegistryError> {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if let Some(existing) = sessions.get(&session.key) {
            if !existing.session.status().is_terminal() {
                return Err(RegistryError::AlreadyActive {
                    key: session.key.clone(),
                });
            }
        }
        let handle = Arc::new(SessionHandle::new(session));
        sessions.insert(handle.session.key.clone(), handle.clone());
        Ok(handle)
    }

    /// Register a session, or hand back the live handle if this key is
    /// already running so the caller can attach instead of starting twice.
    pub fn open(&self, session: Arc<IndexingSession>) -> (Arc<SessionHandle>, bool) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        if let Some(existing) = sessions.get(&session.key) {
            if !existing.session.status().is_terminal() {
                return (existing.clone(), false);
            }
        }
        let handle = Arc::new(SessionHandle::new(session));
        sessions.insert(handle.session.key.clone(), handle.clone());
        (handle, true)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    /// Attach to a running session's progress stream.
    pub fn attach(
        &self,
        key: &SessionKey,
    ) -> Result<broadcast::Receiver<ProgressEvent>, RegistryError> {
        self.get(key)
            .map(|handle| handle.subscribe())
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })
    }

    pub fn cancel(&self, key: &SessionKey) -> Result<(), RegistryError> {
        let handle = self
            .get(key)
            .ok_or_else(|| RegistryError::NotFound { key: key.clone() })?;
        handle.cancel();
        Ok(())
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(key)
    }

    pub fn active(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|handle| !handle.session.status().is_terminal())
            .cloned()
            .collect()
    }
}
