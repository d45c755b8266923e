//! Durable credential storage for bridge sessions.
//!
//! [`CredentialStore`] is the persistence seam. [`HttpCredentialStore`] speaks the
//! backend's `/auth` contract; [`MemoryCredentialStore`] keeps everything in
//! process. [`AuthSync`] sits in front of either and batches key writes.

pub mod backend;
pub mod error;
pub mod http;
pub mod memory;
pub mod store;
pub mod sync;

pub use backend::{BackendClient, API_KEY_HEADER};
pub use error::StoreError;
pub use http::HttpCredentialStore;
pub use memory::{MemoryCredentialStore, SyncBatch};
pub use store::{CredentialStore, RestorableSession, StoredAuth};
pub use sync::AuthSync;
