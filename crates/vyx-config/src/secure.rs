//! Bearer-token storage behind the OS credential store.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::defaults::CREDENTIAL_SERVICE;
use crate::error::CredentialError;

/// Token storage contract.
///
/// The production implementation is [`KeyringStore`]; tests use
/// [`MemoryStore`] so they never touch a real keychain.
pub trait CredentialStore: Send + Sync {
    /// Store (or replace) the token for a user.
    fn save_token(&self, user_id: &str, token: &str) -> Result<(), CredentialError>;

    /// Fetch the token for a user. `NotFound` is a distinct, expected case.
    fn token(&self, user_id: &str) -> Result<String, CredentialError>;

    /// Remove the token for a user. Removing a missing token is a no-op.
    fn delete_token(&self, user_id: &str) -> Result<(), CredentialError>;

    /// Whether a token exists for a user.
    fn has_token(&self, user_id: &str) -> bool {
        self.token(user_id).is_ok()
    }
}

/// OS-native credential store (Keychain / Credential Manager / Secret
/// Service), entries keyed `(service = "vyx-proxy-client", account = user_id)`.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: CREDENTIAL_SERVICE.to_string(),
        }
    }

    fn entry(&self, user_id: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, user_id)
            .map_err(|e| CredentialError::Backend(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn save_token(&self, user_id: &str, token: &str) -> Result<(), CredentialError> {
        self.entry(user_id)?
            .set_password(token)
            .map_err(|e| CredentialError::Backend(e.to_string()))
    }

    fn token(&self, user_id: &str) -> Result<String, CredentialError> {
        match self.entry(user_id)?.get_password() {
            Ok(token) => Ok(token),
            Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound(user_id.to_string())),
            Err(e) => Err(CredentialError::Backend(e.to_string())),
        }
    }

    fn delete_token(&self, user_id: &str) -> Result<(), CredentialError> {
        match self.entry(user_id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Backend(e.to_string())),
        }
    }
}

/// In-memory store for tests and headless environments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn save_token(&self, user_id: &str, token: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .expect("credential store lock poisoned")
            .insert(user_id.to_string(), token.to_string());
        Ok(())
    }

    fn token(&self, user_id: &str) -> Result<String, CredentialError> {
        self.tokens
            .lock()
            .expect("credential store lock poisoned")
            .get(user_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(user_id.to_string()))
    }

    fn delete_token(&self, user_id: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .expect("credential store lock poisoned")
            .remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.token("u1"),
            Err(CredentialError::NotFound(_))
        ));

        store.save_token("u1", "tok-abc").unwrap();
        assert_eq!(store.token("u1").unwrap(), "tok-abc");
        assert!(store.has_token("u1"));

        store.delete_token("u1").unwrap();
        assert!(!store.has_token("u1"));
        // Deleting again is a no-op.
        store.delete_token("u1").unwrap();
    }
}
