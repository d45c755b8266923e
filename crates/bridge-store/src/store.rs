use async_trait::async_trait;
use bridge_core::{AuthState, KeyMap, Material, SessionId};

use crate::error::StoreError;

/// Durable authentication state of one session as loaded from the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredAuth {
    pub credentials: Option<Material>,
    pub keys: KeyMap,
    pub has_credentials: bool,
}

impl StoredAuth {
    /// Nothing persisted: a fresh pairing is required.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn into_auth_state(self) -> AuthState {
        AuthState::new(self.credentials, self.keys)
    }
}

/// A session with durable credentials, eligible for restore at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestorableSession {
    pub session_id: SessionId,
    pub phone_number: Option<String>,
}

/// Durable credential storage.
///
/// Writes are idempotent upserts by composite key, so re-applying a batch after
/// a failure is always safe.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> Result<StoredAuth, StoreError>;

    async fn save_credentials(
        &self,
        session_id: &SessionId,
        credentials: &Material,
    ) -> Result<(), StoreError>;

    async fn sync_keys(
        &self,
        session_id: &SessionId,
        set: &KeyMap,
        delete: &[String],
    ) -> Result<(), StoreError>;

    /// Remove every durable record of the session.
    async fn purge(&self, session_id: &SessionId) -> Result<(), StoreError>;

    async fn list_restorable(&self) -> Result<Vec<RestorableSession>, StoreError>;
}
