//! Credential persistence for the Aquaman proxy.
//!
//! One polymorphic interface, five concrete backends: process memory,
//! password-encrypted file, native OS keyring, the 1Password CLI, and
//! HashiCorp Vault KV v2. The proxy only ever sees [`CredentialStore`];
//! [`build_store`] picks the implementation from configuration and refuses
//! to hand back a backend that failed its health check.

pub mod encrypted_file;
pub mod memory;
pub mod native;
pub mod op_cli;
pub mod vault;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use aquaman_core::config::{AquamanConfig, StoreBackend};
use aquaman_core::naming;

/// Errors a credential backend can produce.
///
/// `get` reports a missing credential as `Ok(None)`, never as an error;
/// everything here is a real failure.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("wrong password for credential store")]
    WrongPassword,

    #[error("credential backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Optional metadata stored next to a credential. The proxy never reads it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl CredentialMetadata {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            created_at: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// The backend contract. `get` runs concurrently from many request handlers;
/// implementations serialize writes internally.
#[async_trait]
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Fetch a credential. `Ok(None)` means not found.
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Create or overwrite a credential.
    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError>;

    /// Remove a credential. `true` if a record was removed.
    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError>;

    /// Full inventory as `(service, key)` pairs, optionally filtered.
    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError>;

    async fn exists(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(service, key).await?.is_some())
    }
}

/// Validate `(service, key)` before any backend composes a path, URL,
/// process argument, or keyring account from them.
pub(crate) fn check_names(service: &str, key: &str) -> Result<(), StoreError> {
    if !naming::is_safe_name(service) {
        return Err(StoreError::InvalidName(format!("service {service:?}")));
    }
    if !naming::is_safe_name(key) {
        return Err(StoreError::InvalidName(format!("key {key:?}")));
    }
    Ok(())
}

/// Construct the configured backend and run its startup health check.
///
/// A backend that cannot be reached (missing CLI, unreachable server, wrong
/// password) fails here; the daemon refuses to start rather than silently
/// degrading.
pub async fn build_store(config: &AquamanConfig) -> Result<Arc<dyn CredentialStore>, StoreError> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory credential store; secrets will not survive restart");
            Ok(Arc::new(memory::MemoryStore::new()))
        }
        StoreBackend::EncryptedFile => {
            let password = std::env::var(&config.store.encrypted_file.password_env).map_err(|_| {
                StoreError::Unavailable(format!(
                    "store password env {} is not set",
                    config.store.encrypted_file.password_env
                ))
            })?;
            let store =
                encrypted_file::EncryptedFileStore::open(config.encrypted_file_path(), &password)
                    .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Keyring => {
            let store = native::KeyringStore::open().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Op => {
            let store =
                op_cli::OpCliStore::connect(config.store.op.vault.clone(), config.store.op.tag.clone())
                    .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Vault => {
            let token = std::env::var(&config.store.vault.token_env).map_err(|_| {
                StoreError::Unavailable(format!(
                    "vault token env {} is not set",
                    config.store.vault.token_env
                ))
            })?;
            let store = vault::VaultStore::connect(&config.store.vault, token).await?;
            Ok(Arc::new(store))
        }
    }
}
