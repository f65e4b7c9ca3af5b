//! Credential store backing the session: the access/renewal pair plus a cached
//! user profile, kept in an external key-value store.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use backend_core::{BackendError, BackendErrorCategory, CredentialPair, UserProfile};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

const CREDENTIALS_KEY: &str = "session-credentials";
const PROFILE_KEY: &str = "user-profile";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value store backend failure: {0}")]
    Backend(String),
    #[error("stored value for '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Map to the stable backend error payload, naming the failed operation.
    pub fn into_backend_error(self, operation: &str) -> BackendError {
        let code = match &self {
            Self::Unavailable(_) => "credential_store_unavailable",
            Self::Backend(_) => "credential_store_error",
            Self::Corrupt { .. } => "credential_store_corrupt",
        };
        BackendError::new(
            BackendErrorCategory::Storage,
            code,
            format!("{operation}: {self}"),
        )
    }
}

/// Plain string key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key; removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(key);
        Ok(())
    }
}

/// OS keyring entries under one service name.
#[cfg(feature = "os-keyring")]
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

#[cfg(feature = "os-keyring")]
impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, key).map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[cfg(feature = "os-keyring")]
impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::NoStorageAccess(err)) => {
                Err(StoreError::Unavailable(err.to_string()))
            }
            Err(other) => Err(StoreError::Backend(other.to_string())),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(other) => Err(StoreError::Backend(other.to_string())),
        }
    }
}

/// Typed access to the persisted session.
///
/// The credential pair lives in a single entry, so a save replaces both
/// tokens or neither.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::default()))
    }

    pub fn load_credentials(&self) -> Result<Option<CredentialPair>, StoreError> {
        self.load_json(CREDENTIALS_KEY)
    }

    pub fn save_credentials(&self, pair: &CredentialPair) -> Result<(), StoreError> {
        self.save_json(CREDENTIALS_KEY, pair)?;
        debug!("credential pair persisted");
        Ok(())
    }

    pub fn load_profile(&self) -> Result<Option<UserProfile>, StoreError> {
        self.load_json(PROFILE_KEY)
    }

    pub fn save_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.save_json(PROFILE_KEY, profile)
    }

    /// Remove credentials and profile together.
    ///
    /// Both removals are attempted; the first failure is returned.
    pub fn clear(&self) -> Result<(), StoreError> {
        let credentials = self.store.remove(CREDENTIALS_KEY);
        let profile = self.store.remove(PROFILE_KEY);
        if let Err(err) = &credentials {
            warn!(error = %err, "failed clearing persisted credentials");
        }
        if let Err(err) = &profile {
            warn!(error = %err, "failed clearing cached profile");
        }
        credentials.and(profile)
    }

    fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key: key.to_owned(),
                reason: err.to_string(),
            })
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value).map_err(|err| StoreError::Corrupt {
            key: key.to_owned(),
            reason: err.to_string(),
        })?;
        self.store.put(key, &encoded)
    }
}
