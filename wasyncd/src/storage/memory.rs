use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use wasync_core::{Credential, LegacyToken};

use super::{CredentialStore, StorageError};

/// In-process store for tests and one-shot runs with injected tokens.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: Mutex<Option<Credential>>,
    legacy: Mutex<Option<LegacyToken>>,
    legacy_clears: AtomicUsize,
    legacy_clear_fails: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
            ..Self::default()
        }
    }

    pub fn with_legacy_token(legacy: LegacyToken) -> Self {
        Self {
            legacy: Mutex::new(Some(legacy)),
            ..Self::default()
        }
    }

    /// Makes `clear_legacy_token` fail until reset, like a locked keyring.
    pub fn set_legacy_clear_failing(&self, failing: bool) {
        self.legacy_clear_fails.store(failing, Ordering::SeqCst);
    }

    /// How many times a present legacy token was cleared.
    pub fn legacy_clears(&self) -> usize {
        self.legacy_clears.load(Ordering::SeqCst)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credential(&self) -> Result<Option<Credential>, StorageError> {
        Ok(lock(&self.credential).clone())
    }

    fn save_credential(&self, credential: &Credential) -> Result<(), StorageError> {
        *lock(&self.credential) = Some(credential.clone());
        Ok(())
    }

    fn delete_credential(&self) -> Result<(), StorageError> {
        *lock(&self.credential) = None;
        Ok(())
    }

    fn load_legacy_token(&self) -> Result<Option<LegacyToken>, StorageError> {
        Ok(lock(&self.legacy).clone())
    }

    fn clear_legacy_token(&self) -> Result<(), StorageError> {
        if self.legacy_clear_fails.load(Ordering::SeqCst) {
            return Err(StorageError::Keyring(keyring::Error::PlatformFailure(
                "keyring is locked".into(),
            )));
        }
        if lock(&self.legacy).take().is_some() {
            self.legacy_clears.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_token_is_cleared_once() {
        let store = MemoryCredentialStore::with_legacy_token(LegacyToken {
            token: "t".into(),
            secret: "s".into(),
        });
        assert!(store.load_legacy_token().unwrap().is_some());
        store.clear_legacy_token().unwrap();
        store.clear_legacy_token().unwrap();
        assert_eq!(store.legacy_clears(), 1);
        assert!(store.load_legacy_token().unwrap().is_none());
    }

    #[test]
    fn failing_clear_keeps_legacy_token() {
        let store = MemoryCredentialStore::with_legacy_token(LegacyToken {
            token: "t".into(),
            secret: "s".into(),
        });
        store.set_legacy_clear_failing(true);
        assert!(store.clear_legacy_token().is_err());
        assert!(store.load_legacy_token().unwrap().is_some());
        assert_eq!(store.legacy_clears(), 0);
    }

    #[test]
    fn credential_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.load_credential().unwrap().is_none());
        let credential = Credential {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: None,
        };
        store.save_credential(&credential).unwrap();
        assert_eq!(store.load_credential().unwrap(), Some(credential));
        store.delete_credential().unwrap();
        assert!(store.load_credential().unwrap().is_none());
    }
}
