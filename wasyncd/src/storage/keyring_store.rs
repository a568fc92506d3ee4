use keyring::Entry;
use serde::{Serialize, de::DeserializeOwned};
use wasync_core::{Credential, LegacyToken};

use super::{CredentialStore, StorageError};

const SERVICE_NAME: &str = "org.frasergo.wasync";
const CREDENTIAL_KEY: &str = "oauth2_credential";
const LEGACY_KEY: &str = "legacy_token";

/// Credentials kept in the OS keyring as JSON secrets.
pub struct KeyringCredentialStore {
    credential: Entry,
    legacy: Entry,
}

impl KeyringCredentialStore {
    pub fn for_account(account: &str) -> Result<Self, StorageError> {
        Ok(Self {
            credential: Entry::new(SERVICE_NAME, &entry_user(CREDENTIAL_KEY, account))?,
            legacy: Entry::new(SERVICE_NAME, &entry_user(LEGACY_KEY, account))?,
        })
    }
}

fn entry_user(key: &str, account: &str) -> String {
    format!("{key}:{}", account.trim().to_ascii_lowercase())
}

impl CredentialStore for KeyringCredentialStore {
    fn load_credential(&self) -> Result<Option<Credential>, StorageError> {
        read_json(&self.credential)
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        write_json(&self.credential, credential)
    }

    fn delete_credential(&self) -> Result<(), StorageError> {
        delete_entry(&self.credential)
    }

    fn load_legacy_token(&self) -> Result<Option<LegacyToken>, StorageError> {
        read_json(&self.legacy)
    }

    fn clear_legacy_token(&self) -> Result<(), StorageError> {
        delete_entry(&self.legacy)
    }
}

fn read_json<T: DeserializeOwned>(entry: &Entry) -> Result<Option<T>, StorageError> {
    match entry.get_password() {
        Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(StorageError::Keyring(err)),
    }
}

fn write_json<T: Serialize>(entry: &Entry, value: &T) -> Result<(), StorageError> {
    let secret = serde_json::to_string(value)?;
    entry.set_password(&secret)?;
    Ok(())
}

fn delete_entry(entry: &Entry) -> Result<(), StorageError> {
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(StorageError::Keyring(err)),
    }
}
