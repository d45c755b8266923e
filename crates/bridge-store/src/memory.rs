//! In-process credential store for ephemeral runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::{protocol::has_identity, KeyMap, Material, SessionId};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::{CredentialStore, RestorableSession, StoredAuth};

#[derive(Clone, Debug, Default)]
struct Record {
    credentials: Option<Material>,
    keys: KeyMap,
}

/// One `sync_keys` call as received.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncBatch {
    pub session_id: SessionId,
    pub set: KeyMap,
    pub delete: Vec<String>,
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<SessionId, Record>>,
    batches: Mutex<Vec<SyncBatch>>,
    load_delay: Mutex<Option<Duration>>,
    fail_syncs: AtomicUsize,
    fail_saves: AtomicUsize,
    fail_loads: AtomicUsize,
    saves: AtomicUsize,
    purges: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session as if it had paired earlier.
    pub fn insert(&self, session_id: &SessionId, credentials: Material, keys: KeyMap) {
        self.records.lock().insert(
            session_id.clone(),
            Record {
                credentials: Some(credentials),
                keys,
            },
        );
    }

    pub fn credentials(&self, session_id: &SessionId) -> Option<Material> {
        self.records
            .lock()
            .get(session_id)
            .and_then(|r| r.credentials.clone())
    }

    pub fn keys(&self, session_id: &SessionId) -> KeyMap {
        self.records
            .lock()
            .get(session_id)
            .map(|r| r.keys.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.records.lock().contains_key(session_id)
    }

    pub fn sync_batches(&self) -> Vec<SyncBatch> {
        self.batches.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// Make the next `n` key syncs fail with a 503.
    pub fn fail_next_syncs(&self, n: usize) {
        self.fail_syncs.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_loads(&self, n: usize) {
        self.fail_loads.store(n, Ordering::SeqCst);
    }

    /// Delay every load. A delay past the caller's deadline looks like a timeout.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn unavailable() -> StoreError {
    StoreError::Status {
        status: 503,
        body: "injected failure".into(),
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, session_id: &SessionId) -> Result<StoredAuth, StoreError> {
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.fail_loads) {
            return Err(unavailable());
        }
        let record = self.records.lock().get(session_id).cloned().unwrap_or_default();
        let has_credentials = record.credentials.as_ref().is_some_and(has_identity);
        Ok(StoredAuth {
            credentials: record.credentials,
            keys: record.keys,
            has_credentials,
        })
    }

    async fn save_credentials(
        &self,
        session_id: &SessionId,
        credentials: &Material,
    ) -> Result<(), StoreError> {
        if take_failure(&self.fail_saves) {
            return Err(unavailable());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .entry(session_id.clone())
            .or_default()
            .credentials = Some(credentials.clone());
        Ok(())
    }

    async fn sync_keys(
        &self,
        session_id: &SessionId,
        set: &KeyMap,
        delete: &[String],
    ) -> Result<(), StoreError> {
        if take_failure(&self.fail_syncs) {
            return Err(unavailable());
        }
        self.batches.lock().push(SyncBatch {
            session_id: session_id.clone(),
            set: set.clone(),
            delete: delete.to_vec(),
        });
        let mut records = self.records.lock();
        let record = records.entry(session_id.clone()).or_default();
        for key in delete {
            record.keys.remove(key);
        }
        record
            .keys
            .extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn purge(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        self.records.lock().remove(session_id);
        Ok(())
    }

    async fn list_restorable(&self) -> Result<Vec<RestorableSession>, StoreError> {
        let records = self.records.lock();
        let mut sessions: Vec<_> = records
            .iter()
            .filter(|(_, r)| r.credentials.as_ref().is_some_and(has_identity))
            .map(|(id, r)| RestorableSession {
                session_id: id.clone(),
                phone_number: r
                    .credentials
                    .as_ref()
                    .and_then(|c| c.get("me"))
                    .and_then(|me| me.get("id"))
                    .and_then(Material::as_text)
                    .map(|jid| bridge_core::address::user_part(jid).to_string()),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }
}
