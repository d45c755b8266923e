//! Process-wide session map.
//!
//! The registry owns one [`SessionEntry`] per id and routes every operation to
//! that session's actor. It is created once by the composition root and shared
//! by reference; there is no global instance.

use std::sync::Arc;

use bridge_core::{MessageId, SessionId};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::lifecycle::{Command, SessionDeps, SessionEntry, SessionSnapshot, StartMode};

pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    deps: SessionDeps,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
        }
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn entry(&self, id: &SessionId) -> Arc<SessionEntry> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| Arc::new(SessionEntry::spawn(id.clone(), &self.deps)))
            .clone()
    }

    fn get(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Drop `entry` from the map unless it has already been replaced.
    fn remove_entry(&self, entry: &Arc<SessionEntry>) {
        self.sessions
            .remove_if(&entry.id, |_, current| Arc::ptr_eq(current, entry));
    }

    /// Start (or resume) a session. Idempotent while connected or while a
    /// pairing challenge is outstanding.
    pub async fn start(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        self.start_with(id, StartMode::Interactive).await
    }

    /// Start from stored credentials only. Sessions without credentials are
    /// skipped and left out of the map.
    pub async fn start_restore(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        self.start_with(id, StartMode::Restore).await
    }

    async fn start_with(
        &self,
        id: &SessionId,
        mode: StartMode,
    ) -> Result<SessionSnapshot, SessionError> {
        // One retry covers an actor that stopped between lookup and send.
        for _ in 0..2 {
            let entry = self.entry(id);
            match entry.call(|reply| Command::Start { mode, reply }).await {
                Err(SessionError::ChannelClosed(_)) => {
                    self.remove_entry(&entry);
                    continue;
                }
                Ok(Err(e @ SessionError::NoCredentials(_))) => {
                    self.stop(&entry).await;
                    return Err(e);
                }
                Ok(result) => return result,
                Err(e) => return Err(e),
            }
        }
        Err(SessionError::ChannelClosed(id.clone()))
    }

    /// Current snapshot, or `not_started` for unknown ids.
    pub fn status(&self, id: &SessionId) -> SessionSnapshot {
        self.get(id)
            .map(|entry| entry.snapshot())
            .unwrap_or_else(|| SessionSnapshot::not_started(id.clone()))
    }

    pub async fn send(
        &self,
        id: &SessionId,
        to: &str,
        text: &str,
    ) -> Result<MessageId, SessionError> {
        let Some(entry) = self.get(id) else {
            return Err(SessionError::NotConnected {
                session_id: id.clone(),
                status: bridge_core::SessionStatus::NotStarted,
            });
        };
        entry
            .call(|reply| Command::Send {
                to: to.to_string(),
                text: text.to_string(),
                reply,
            })
            .await?
    }

    /// Close the connection and forget the session. Credentials are kept.
    pub async fn disconnect(&self, id: &SessionId) -> Result<(), SessionError> {
        if let Some(entry) = self.get(id) {
            self.stop(&entry).await;
            info!(session_id = %id, "session removed");
        }
        Ok(())
    }

    /// Close, unlink and purge. Unknown ids still purge the store.
    pub async fn logout(&self, id: &SessionId) -> Result<(), SessionError> {
        let Some(entry) = self.get(id) else {
            self.deps.store.purge(id).await?;
            info!(session_id = %id, "purged credentials of inactive session");
            return Ok(());
        };
        let result = match entry.call(|reply| Command::Logout { reply }).await {
            Ok(result) => result,
            // The actor stopped on its own; purge directly.
            Err(_) => self.deps.store.purge(id).await.map_err(SessionError::from),
        };
        self.remove_entry(&entry);
        result
    }

    /// Logout followed by a fresh start, which pairs anew.
    pub async fn reset(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        self.logout(id).await?;
        self.start(id).await
    }

    /// Every session, ordered by id.
    pub fn list_all(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Stop every session, flushing pending key writes. Durable state is kept.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(sessions = entries.len(), "shutting down sessions");
        futures::future::join_all(entries.iter().map(|entry| self.stop(entry))).await;
    }

    async fn stop(&self, entry: &Arc<SessionEntry>) {
        if let Err(e) = entry.call(|reply| Command::Disconnect { reply }).await {
            warn!(session_id = %entry.id, error = %e, "session actor already stopped");
            entry.task.abort();
        }
        self.remove_entry(entry);
    }
}
