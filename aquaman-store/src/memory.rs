use async_trait::async_trait;
use dashmap::DashMap;

use crate::{CredentialMetadata, CredentialStore, StoreError, check_names};

/// Process-memory backend.
///
/// Used by tests and available behind an explicit config opt-in. Never used
/// as a fallback when a real backend fails.
#[derive(Default, Debug)]
pub struct MemoryStore {
    records: DashMap<(String, String), String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_names(service, key)?;
        Ok(self
            .records
            .get(&(service.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        _metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError> {
        check_names(service, key)?;
        self.records
            .insert((service.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        check_names(service, key)?;
        Ok(self
            .records
            .remove(&(service.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let mut out: Vec<(String, String)> = self
            .records
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|(s, _)| service.is_none_or(|want| s.as_str() == want))
            .collect();
        out.sort();
        Ok(out)
    }
}
