//! Native OS keyring backend.
//!
//! Each `(service, key)` pair maps to one keyring entry: the keyring
//! "service" is the fixed application identifier and the account is the
//! joined `service:key`. OS keyrings cannot enumerate entries, so the
//! backend maintains its own inventory in a JSON index entry under the
//! reserved `__index__` account, updated on every set/delete.
//!
//! Keyring calls are blocking platform APIs and run under `spawn_blocking`.

use async_trait::async_trait;
use keyring::Entry;
use tokio::sync::Mutex;

use crate::{CredentialMetadata, CredentialStore, StoreError, check_names};

const APP_SERVICE: &str = "aquaman";
const INDEX_ACCOUNT: &str = "__index__";

#[derive(Debug)]
pub struct KeyringStore {
    /// Serializes index read-modify-write cycles.
    index_lock: Mutex<()>,
}

impl KeyringStore {
    /// Open the backend, probing that the platform keyring is reachable.
    pub async fn open() -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(|| -> Result<(), StoreError> {
            let entry = Entry::new(APP_SERVICE, INDEX_ACCOUNT)
                .map_err(|e| StoreError::Unavailable(format!("keyring: {e}")))?;
            match entry.get_password() {
                Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(StoreError::Unavailable(format!("keyring: {e}"))),
            }
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {e}")))??;

        Ok(Self { index_lock: Mutex::new(()) })
    }

    fn account(service: &str, key: &str) -> String {
        format!("{service}:{key}")
    }

    fn read_index() -> Result<Vec<String>, StoreError> {
        let entry = Entry::new(APP_SERVICE, INDEX_ACCOUNT)
            .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;
        match entry.get_password() {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| StoreError::Backend(format!("keyring index is corrupt: {e}"))),
            Err(keyring::Error::NoEntry) => Ok(Vec::new()),
            Err(e) => Err(StoreError::Backend(format!("keyring: {e}"))),
        }
    }

    fn write_index(index: &[String]) -> Result<(), StoreError> {
        let entry = Entry::new(APP_SERVICE, INDEX_ACCOUNT)
            .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;
        let raw = serde_json::to_string(index)
            .map_err(|e| StoreError::Backend(format!("serialize index: {e}")))?;
        entry
            .set_password(&raw)
            .map_err(|e| StoreError::Backend(format!("keyring: {e}")))
    }
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_names(service, key)?;
        let account = Self::account(service, key);
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(APP_SERVICE, &account)
                .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;
            match entry.get_password() {
                Ok(value) => Ok(Some(value)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(StoreError::Backend(format!("keyring: {e}"))),
            }
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {e}")))?
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        _metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError> {
        check_names(service, key)?;
        let _guard = self.index_lock.lock().await;
        let account = Self::account(service, key);
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(APP_SERVICE, &account)
                .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;
            entry
                .set_password(&value)
                .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;

            let mut index = KeyringStore::read_index()?;
            if !index.contains(&account) {
                index.push(account);
                index.sort();
                KeyringStore::write_index(&index)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {e}")))?
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        check_names(service, key)?;
        let _guard = self.index_lock.lock().await;
        let account = Self::account(service, key);
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(APP_SERVICE, &account)
                .map_err(|e| StoreError::Backend(format!("keyring: {e}")))?;
            let removed = match entry.delete_credential() {
                Ok(()) => true,
                Err(keyring::Error::NoEntry) => false,
                Err(e) => return Err(StoreError::Backend(format!("keyring: {e}"))),
            };

            let mut index = KeyringStore::read_index()?;
            if let Some(pos) = index.iter().position(|a| a == &account) {
                index.remove(pos);
                KeyringStore::write_index(&index)?;
            }
            Ok(removed)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {e}")))?
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let service = service.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let index = KeyringStore::read_index()?;
            Ok(index
                .iter()
                .filter_map(|composite| {
                    let (s, k) = composite.split_once(':')?;
                    if service.as_deref().is_none_or(|want| s == want) {
                        Some((s.to_string(), k.to_string()))
                    } else {
                        None
                    }
                })
                .collect())
        })
        .await
        .map_err(|e| StoreError::Backend(format!("join: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_joins_service_and_key() {
        assert_eq!(KeyringStore::account("anthropic", "api_key"), "anthropic:api_key");
    }

    #[tokio::test]
    async fn unsafe_names_never_reach_the_platform_keyring() {
        // Constructing the store would touch the real keyring; name checks
        // run first, so an invalid name fails without one.
        let store = KeyringStore { index_lock: Mutex::new(()) };
        assert!(matches!(
            store.get("../etc", "k").await,
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.set("svc", "bad key", "v", None).await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
