mod keyring_store;
mod memory;

use thiserror::Error;
use wasync_core::{Credential, LegacyToken};

pub use keyring_store::KeyringCredentialStore;
pub use memory::MemoryCredentialStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("stored credential is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistent home of the account credential and any legacy token.
pub trait CredentialStore: Send + Sync {
    fn load_credential(&self) -> Result<Option<Credential>, StorageError>;
    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError>;
    fn delete_credential(&self) -> Result<(), StorageError>;
    fn load_legacy_token(&self) -> Result<Option<LegacyToken>, StorageError>;
    fn clear_legacy_token(&self) -> Result<(), StorageError>;
}
