//! Credential store backed by the backend's `/auth` endpoints.

use async_trait::async_trait;
use bridge_core::{protocol::has_identity, KeyMap, Material, SessionId};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::BackendClient;
use crate::error::StoreError;
use crate::store::{CredentialStore, RestorableSession, StoredAuth};

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    creds: Material,
    #[serde(default)]
    keys: KeyMap,
    #[serde(default)]
    has_credentials: bool,
}

#[derive(Serialize)]
struct CredsRequest<'a> {
    creds: &'a Material,
}

#[derive(Serialize)]
struct KeysPatch<'a> {
    set_keys: &'a KeyMap,
    delete_keys: &'a [String],
}

#[derive(Deserialize)]
struct RestorableResponse {
    #[serde(default)]
    sessions: Vec<RestorableEntry>,
}

#[derive(Deserialize)]
struct RestorableEntry {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
}

pub struct HttpCredentialStore {
    client: BackendClient,
}

impl HttpCredentialStore {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }
}

/// The backend answers `{}` for a session it has never seen.
fn present(creds: Material) -> Option<Material> {
    match creds {
        Material::Null => None,
        Material::Map(ref m) if m.is_empty() => None,
        other => Some(other),
    }
}

#[async_trait]
impl CredentialStore for HttpCredentialStore {
    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn load(&self, session_id: &SessionId) -> Result<StoredAuth, StoreError> {
        let resp: AuthResponse = self.client.get_json(&["auth", session_id.as_str()]).await?;
        let credentials = present(resp.creds);
        let has_credentials =
            resp.has_credentials || credentials.as_ref().is_some_and(has_identity);
        debug!(keys = resp.keys.len(), has_credentials, "loaded auth state");
        Ok(StoredAuth {
            credentials,
            keys: resp.keys,
            has_credentials,
        })
    }

    async fn save_credentials(
        &self,
        session_id: &SessionId,
        credentials: &Material,
    ) -> Result<(), StoreError> {
        self.client
            .send_json(
                Method::PUT,
                &["auth", session_id.as_str(), "creds"],
                &CredsRequest { creds: credentials },
            )
            .await
    }

    async fn sync_keys(
        &self,
        session_id: &SessionId,
        set: &KeyMap,
        delete: &[String],
    ) -> Result<(), StoreError> {
        if set.is_empty() && delete.is_empty() {
            return Ok(());
        }
        self.client
            .send_json(
                Method::PATCH,
                &["auth", session_id.as_str(), "keys"],
                &KeysPatch {
                    set_keys: set,
                    delete_keys: delete,
                },
            )
            .await
    }

    async fn purge(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.client.delete(&["auth", session_id.as_str()]).await
    }

    async fn list_restorable(&self) -> Result<Vec<RestorableSession>, StoreError> {
        let resp: RestorableResponse = self.client.get_json(&["auth", "restorable"]).await?;
        Ok(resp
            .sessions
            .into_iter()
            .filter_map(|entry| {
                let id = entry.session_id.or(entry.user_id)?;
                Some(RestorableSession {
                    session_id: SessionId::from_raw(id),
                    phone_number: entry.phone_number,
                })
            })
            .collect())
    }
}
