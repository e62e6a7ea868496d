//! HashiCorp Vault KV v2 backend.
//!
//! Each credential is a versioned secret at
//! `<mount>/data/<prefix>/<service>/<key>` with the value and metadata in the
//! secret payload. Listing walks the metadata tree; deletion removes the
//! metadata path (all versions). The token and optional namespace ride as
//! headers on every request.
//!
//! Network failures surface as [`StoreError::Unavailable`], never as a
//! missing credential.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use aquaman_core::config::VaultConfig;

use crate::{CredentialMetadata, CredentialStore, StoreError, check_names};

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

#[derive(Debug)]
pub struct VaultStore {
    client: reqwest::Client,
    address: String,
    mount: String,
    prefix: String,
    token: String,
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: ReadOuter,
}

#[derive(Debug, Deserialize)]
struct ReadOuter {
    data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListKeys,
}

#[derive(Debug, Deserialize)]
struct ListKeys {
    keys: Vec<String>,
}

impl VaultStore {
    /// Connect and verify the server is reachable. Any HTTP answer from
    /// `sys/health` counts as reachable; only transport failures are fatal.
    pub async fn connect(config: &VaultConfig, token: String) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| StoreError::Unavailable(format!("vault client: {e}")))?;

        let store = Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            mount: config.mount.clone(),
            prefix: config.prefix.clone(),
            token,
            namespace: config.namespace.clone(),
        };

        let health_url = format!("{}/v1/sys/health", store.address);
        store
            .request(reqwest::Method::GET, &health_url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault unreachable: {e}")))?;

        info!(address = %store.address, mount = %store.mount, "vault backend ready");
        Ok(store)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url).header(TOKEN_HEADER, &self.token);
        if let Some(ns) = &self.namespace {
            builder = builder.header(NAMESPACE_HEADER, ns);
        }
        builder
    }

    fn data_url(&self, service: &str, key: &str) -> String {
        format!(
            "{}/v1/{}/data/{}/{service}/{key}",
            self.address, self.mount, self.prefix
        )
    }

    fn metadata_url(&self, service: &str, key: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}/{service}/{key}",
            self.address, self.mount, self.prefix
        )
    }

    fn list_url(&self, service: Option<&str>) -> String {
        match service {
            Some(s) => format!(
                "{}/v1/{}/metadata/{}/{s}?list=true",
                self.address, self.mount, self.prefix
            ),
            None => format!(
                "{}/v1/{}/metadata/{}?list=true",
                self.address, self.mount, self.prefix
            ),
        }
    }

    async fn list_one(&self, service: &str) -> Result<Vec<(String, String)>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, &self.list_url(Some(service)))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault: {e}")))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let parsed: ListResponse = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Backend(format!("vault list payload: {e}")))?;
                Ok(parsed
                    .data
                    .keys
                    .into_iter()
                    .filter(|k| !k.ends_with('/'))
                    .map(|k| (service.to_string(), k))
                    .collect())
            }
            status => Err(StoreError::Backend(format!("vault list returned {status}"))),
        }
    }
}

#[async_trait]
impl CredentialStore for VaultStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_names(service, key)?;
        let resp = self
            .request(reqwest::Method::GET, &self.data_url(service, key))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault: {e}")))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let parsed: ReadResponse = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Backend(format!("vault read payload: {e}")))?;
                Ok(parsed
                    .data
                    .data
                    .get("value")
                    .and_then(|v| v.as_str())
                    .map(str::to_string))
            }
            status => Err(StoreError::Backend(format!("vault read returned {status}"))),
        }
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError> {
        check_names(service, key)?;
        let metadata = metadata.unwrap_or_default();
        let mut payload = serde_json::Map::new();
        payload.insert("value".into(), json!(value));
        if let Some(source) = metadata.source {
            payload.insert("source".into(), json!(source));
        }
        if let Some(created_at) = metadata.created_at {
            payload.insert("created_at".into(), json!(created_at));
        }

        let resp = self
            .request(reqwest::Method::POST, &self.data_url(service, key))
            .json(&json!({ "data": payload }))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("vault write returned {}", resp.status())))
        }
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        check_names(service, key)?;
        let existed = self.exists(service, key).await?;
        if !existed {
            return Ok(false);
        }

        let resp = self
            .request(reqwest::Method::DELETE, &self.metadata_url(service, key))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault: {e}")))?;

        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(true)
        } else {
            Err(StoreError::Backend(format!("vault delete returned {}", resp.status())))
        }
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        if let Some(service) = service {
            let mut pairs = self.list_one(service).await?;
            pairs.sort();
            return Ok(pairs);
        }

        let resp = self
            .request(reqwest::Method::GET, &self.list_url(None))
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("vault: {e}")))?;

        let services: Vec<String> = match resp.status() {
            StatusCode::NOT_FOUND => Vec::new(),
            status if status.is_success() => {
                let parsed: ListResponse = resp
                    .json()
                    .await
                    .map_err(|e| StoreError::Backend(format!("vault list payload: {e}")))?;
                parsed
                    .data
                    .keys
                    .into_iter()
                    .filter_map(|k| k.strip_suffix('/').map(str::to_string))
                    .collect()
            }
            status => return Err(StoreError::Backend(format!("vault list returned {status}"))),
        };

        let mut pairs = Vec::new();
        for service in services {
            pairs.extend(self.list_one(&service).await?);
        }
        pairs.sort();
        Ok(pairs)
    }
}
