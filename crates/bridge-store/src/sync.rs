//! Debounced, batched persistence of key material for one session.
//!
//! Key updates accumulate in a pending map and a single flusher task writes them
//! as one `sync_keys` call once the flush window elapses. A failed batch merges
//! back under anything queued since, so nothing is dropped and newer values win.
//! Credential blobs skip the window and are written eagerly; a failed credential
//! write is held and retried with the next window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::{KeyMap, Material, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::CredentialStore;

#[derive(Debug)]
enum Signal {
    Dirty,
    Cancel,
}

#[derive(Default)]
struct Pending {
    /// `None` marks a deletion.
    keys: BTreeMap<String, Option<Material>>,
    credentials: Option<(u64, Material)>,
    issued: u64,
    saved: u64,
    discarded: bool,
}

struct Shared {
    session_id: SessionId,
    store: Arc<dyn CredentialStore>,
    pending: Mutex<Pending>,
    /// Serializes store writes so batches land in issue order.
    write: tokio::sync::Mutex<()>,
}

pub struct AuthSync {
    shared: Arc<Shared>,
    signal: mpsc::UnboundedSender<Signal>,
    flusher: JoinHandle<()>,
}

impl AuthSync {
    pub fn new(session_id: SessionId, store: Arc<dyn CredentialStore>, window: Duration) -> Self {
        let shared = Arc::new(Shared {
            session_id,
            store,
            pending: Mutex::new(Pending::default()),
            write: tokio::sync::Mutex::new(()),
        });
        let (signal, rx) = mpsc::unbounded_channel();
        let flusher = tokio::spawn(run_flusher(shared.clone(), rx, window));
        Self {
            shared,
            signal,
            flusher,
        }
    }

    /// Queue one key-update event. Deletes apply before sets.
    pub fn queue_keys(&self, set: KeyMap, delete: Vec<String>) {
        {
            let mut pending = self.shared.pending.lock();
            if pending.discarded {
                return;
            }
            for key in delete {
                pending.keys.insert(key, None);
            }
            for (key, value) in set {
                pending.keys.insert(key, Some(value));
            }
        }
        let _ = self.signal.send(Signal::Dirty);
    }

    /// Save a credential blob now, without waiting for the window.
    pub fn save_credentials(&self, credentials: Material) {
        {
            let mut pending = self.shared.pending.lock();
            if pending.discarded {
                return;
            }
            pending.issued += 1;
            pending.credentials = Some((pending.issued, credentials));
        }
        let shared = self.shared.clone();
        let signal = self.signal.clone();
        tokio::spawn(async move {
            let _write = shared.write.lock().await;
            if let Err(e) = shared.write_credentials().await {
                warn!(session_id = %shared.session_id, error = %e, "credential save failed, holding for retry");
                let _ = signal.send(Signal::Dirty);
            }
        });
    }

    /// Write everything pending immediately.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.shared.flush().await
    }

    /// Drop pending state and stop the timer. Waits for an in-flight write so
    /// nothing lands after the caller purges the store.
    pub async fn discard(&self) {
        {
            let mut pending = self.shared.pending.lock();
            pending.discarded = true;
            pending.keys.clear();
            pending.credentials = None;
        }
        let _ = self.signal.send(Signal::Cancel);
        let _write = self.shared.write.lock().await;
    }

    pub fn pending_keys(&self) -> usize {
        self.shared.pending.lock().keys.len()
    }

    pub fn has_held_credentials(&self) -> bool {
        self.shared.pending.lock().credentials.is_some()
    }
}

impl Drop for AuthSync {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

impl Shared {
    async fn flush(&self) -> Result<(), StoreError> {
        let _write = self.write.lock().await;
        self.write_credentials().await?;
        self.write_keys().await
    }

    /// Caller holds `write`.
    async fn write_credentials(&self) -> Result<(), StoreError> {
        let taken = {
            let mut pending = self.pending.lock();
            match pending.credentials.take() {
                Some((generation, _)) if generation <= pending.saved => None,
                other => other,
            }
        };
        let Some((generation, credentials)) = taken else {
            return Ok(());
        };

        match self.store.save_credentials(&self.session_id, &credentials).await {
            Ok(()) => {
                let mut pending = self.pending.lock();
                pending.saved = pending.saved.max(generation);
                Ok(())
            }
            Err(e) => {
                let mut pending = self.pending.lock();
                if !pending.discarded && pending.credentials.is_none() {
                    pending.credentials = Some((generation, credentials));
                }
                Err(e)
            }
        }
    }

    /// Caller holds `write`.
    async fn write_keys(&self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut self.pending.lock().keys);
        if batch.is_empty() {
            return Ok(());
        }

        let mut set = KeyMap::new();
        let mut delete = Vec::new();
        for (key, value) in &batch {
            match value {
                Some(value) => {
                    set.insert(key.clone(), value.clone());
                }
                None => delete.push(key.clone()),
            }
        }

        match self.store.sync_keys(&self.session_id, &set, &delete).await {
            Ok(()) => {
                debug!(session_id = %self.session_id, set = set.len(), delete = delete.len(), "key batch persisted");
                Ok(())
            }
            Err(e) => {
                let mut pending = self.pending.lock();
                if !pending.discarded {
                    for (key, value) in batch {
                        pending.keys.entry(key).or_insert(value);
                    }
                }
                Err(e)
            }
        }
    }
}

async fn run_flusher(
    shared: Arc<Shared>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    window: Duration,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(Signal::Dirty) => {
                    deadline.get_or_insert_with(|| Instant::now() + window);
                }
                Some(Signal::Cancel) => deadline = None,
                None => break,
            },
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                if let Err(e) = shared.flush().await {
                    warn!(session_id = %shared.session_id, error = %e, "key flush failed, retrying next window");
                    deadline = Some(Instant::now() + window);
                }
            }
        }
    }
}
