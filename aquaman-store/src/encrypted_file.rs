//! Password-encrypted file backend.
//!
//! The whole store is one blob: `MAGIC || version || salt || nonce ||
//! AES-256-GCM(json record map)`, with the key derived from the password via
//! PBKDF2-HMAC-SHA256. The first open decrypts once and caches the map for
//! the process lifetime; every write re-encrypts with a fresh salt and nonce
//! and replaces the file atomically (temp file, fsync, rename). The file is
//! created `0600` and stays that way.
//!
//! A wrong password fails AEAD authentication and surfaces as
//! [`StoreError::WrongPassword`], never as "not found".

use std::collections::BTreeMap;
use std::path::PathBuf;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::info;

use crate::{CredentialMetadata, CredentialStore, StoreError, check_names};

const MAGIC: &[u8; 4] = b"AQMN";
const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    value: String,
    #[serde(default)]
    metadata: CredentialMetadata,
}

#[derive(Debug)]
pub struct EncryptedFileStore {
    path: PathBuf,
    password: String,
    /// Decrypted records keyed `service:key`. The write guard doubles as the
    /// write serializer.
    cache: RwLock<BTreeMap<String, StoredRecord>>,
}

impl EncryptedFileStore {
    /// Open the store, decrypting an existing file or creating an empty one.
    pub async fn open(path: PathBuf, password: &str) -> Result<Self, StoreError> {
        let records = if path.exists() {
            let blob = std::fs::read(&path)?;
            decrypt_blob(&blob, password)?
        } else {
            BTreeMap::new()
        };

        let store = Self {
            path,
            password: password.to_string(),
            cache: RwLock::new(records),
        };

        if !store.path.exists() {
            // Auto-create so permissions are locked down before any secret lands.
            let guard = store.cache.read().await;
            store.persist(&guard)?;
            info!(path = %store.path.display(), "created encrypted credential store");
        }

        Ok(store)
    }

    fn record_key(service: &str, key: &str) -> String {
        format!("{service}:{key}")
    }

    /// Re-encrypt the full map and atomically replace the store file.
    fn persist(&self, records: &BTreeMap<String, StoredRecord>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let plaintext = serde_json::to_vec(records)
            .map_err(|e| StoreError::Backend(format!("serialize records: {e}")))?;
        let blob = encrypt_blob(&plaintext, &self.password)?;

        let tmp = self.path.with_extension("enc.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            use std::io::Write;
            file.write_all(&blob)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn encrypt_blob(plaintext: &[u8], password: &str) -> Result<Vec<u8>, StoreError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| StoreError::Backend("encryption failed".into()))?;

    let mut blob = Vec::with_capacity(5 + SALT_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(MAGIC);
    blob.push(VERSION);
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn decrypt_blob(blob: &[u8], password: &str) -> Result<BTreeMap<String, StoredRecord>, StoreError> {
    let header_len = 5 + SALT_LEN + NONCE_LEN;
    if blob.len() < header_len || &blob[..4] != MAGIC {
        return Err(StoreError::Backend("credential store file is corrupt".into()));
    }
    if blob[4] != VERSION {
        return Err(StoreError::Backend(format!(
            "unsupported credential store version {}",
            blob[4]
        )));
    }

    let salt = &blob[5..5 + SALT_LEN];
    let nonce = &blob[5 + SALT_LEN..header_len];
    let ciphertext = &blob[header_len..];

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| StoreError::WrongPassword)?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| StoreError::Backend(format!("credential store payload is corrupt: {e}")))
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_names(service, key)?;
        let records = self.cache.read().await;
        Ok(records.get(&Self::record_key(service, key)).map(|r| r.value.clone()))
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError> {
        check_names(service, key)?;
        let mut records = self.cache.write().await;
        records.insert(
            Self::record_key(service, key),
            StoredRecord {
                value: value.to_string(),
                metadata: metadata.unwrap_or_default(),
            },
        );
        self.persist(&records)
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        check_names(service, key)?;
        let mut records = self.cache.write().await;
        let removed = records.remove(&Self::record_key(service, key)).is_some();
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let records = self.cache.read().await;
        Ok(records
            .keys()
            .filter_map(|composite| {
                let (s, k) = composite.split_once(':')?;
                if service.is_none_or(|want| s == want) {
                    Some((s.to_string(), k.to_string()))
                } else {
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("credentials.enc")
    }

    #[tokio::test]
    async fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        {
            let store = EncryptedFileStore::open(path.clone(), "hunter2").await.unwrap();
            store.set("anthropic", "api_key", "sk-ant-TEST", None).await.unwrap();
        }

        // Reopen from disk with the same password.
        let store = EncryptedFileStore::open(path, "hunter2").await.unwrap();
        assert_eq!(
            store.get("anthropic", "api_key").await.unwrap().as_deref(),
            Some("sk-ant-TEST")
        );
    }

    #[tokio::test]
    async fn wrong_password_is_distinct_from_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let store = EncryptedFileStore::open(path.clone(), "correct").await.unwrap();
        store.set("svc", "k", "v", None).await.unwrap();
        drop(store);

        let err = EncryptedFileStore::open(path, "incorrect").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongPassword));
    }

    #[tokio::test]
    async fn file_on_disk_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let store = EncryptedFileStore::open(path.clone(), "pw").await.unwrap();
        store.set("svc", "k", "super-secret-value", None).await.unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(18).any(|w| w == b"super-secret-value"));
        assert_eq!(&raw[..4], MAGIC);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_mode_is_0600_after_set() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let store = EncryptedFileStore::open(path.clone(), "pw").await.unwrap();
        store.set("svc", "k", "v", None).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn auto_creates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        assert!(!path.exists());

        let store = EncryptedFileStore::open(path.clone(), "pw").await.unwrap();
        assert!(path.exists());
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_twice_reports_false_second_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncryptedFileStore::open(store_path(&dir), "pw").await.unwrap();
        store.set("s", "k", "v", None).await.unwrap();
        assert!(store.delete("s", "k").await.unwrap());
        assert!(!store.delete("s", "k").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported_not_decrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        std::fs::write(&path, b"definitely not an encrypted store").unwrap();

        let err = EncryptedFileStore::open(path, "pw").await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);

        let store = EncryptedFileStore::open(path.clone(), "pw").await.unwrap();
        store
            .set("svc", "k", "v", Some(CredentialMetadata::from_source("migration")))
            .await
            .unwrap();
        drop(store);

        let store = EncryptedFileStore::open(path, "pw").await.unwrap();
        let records = store.cache.read().await;
        let record = records.get("svc:k").unwrap();
        assert_eq!(record.metadata.source.as_deref(), Some("migration"));
    }
}
