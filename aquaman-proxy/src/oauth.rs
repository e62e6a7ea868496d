//! Client-credentials token cache.
//!
//! One process-wide cache keyed by service name. Lookups that find a token
//! still inside its validity window (minus the refresh buffer) return it
//! without touching the network; everything else performs the exchange while
//! holding the cache lock, so concurrent requests to the same service ride
//! one POST to the token endpoint instead of stampeding it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use aquaman_core::AquamanError;
use aquaman_core::service::OAuthSettings;
use aquaman_store::CredentialStore;

const DEFAULT_EXPIRES_IN: u64 = 3_600;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct OAuthTokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
    http: reqwest::Client,
    max_entries: usize,
    refresh_buffer: Duration,
}

impl OAuthTokenCache {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            http,
            max_entries: 128,
            refresh_buffer: Duration::from_secs(60),
        }
    }

    #[cfg(test)]
    fn with_limits(http: reqwest::Client, max_entries: usize, refresh_buffer: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            http,
            max_entries,
            refresh_buffer,
        }
    }

    /// Return a valid access token for `service`, exchanging client
    /// credentials when the cache cannot answer.
    pub async fn access_token(
        &self,
        service: &str,
        settings: &OAuthSettings,
        store: &Arc<dyn CredentialStore>,
    ) -> Result<String, AquamanError> {
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(service)
            && cached.expires_at > Instant::now() + self.refresh_buffer
        {
            debug!(service = %service, "oauth cache hit");
            return Ok(cached.access_token.clone());
        }

        let (token, expires_in) = self.exchange(service, settings, store).await?;
        let expires_at = Instant::now() + Duration::from_secs(expires_in);

        // Expired entries go first; if the cache is still full, the soonest
        // to expire makes room.
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.len() >= self.max_entries {
            let evict = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(name, _)| name.clone());
            if let Some(evict) = evict {
                entries.remove(&evict);
            }
        }

        entries.insert(
            service.to_string(),
            CachedToken { access_token: token.clone(), expires_at },
        );
        info!(service = %service, expires_in = expires_in, "oauth token cached");
        Ok(token)
    }

    async fn exchange(
        &self,
        service: &str,
        settings: &OAuthSettings,
        store: &Arc<dyn CredentialStore>,
    ) -> Result<(String, u64), AquamanError> {
        let fetch = |key: String| {
            let store = Arc::clone(store);
            let service = service.to_string();
            async move {
                store
                    .get(&service, &key)
                    .await
                    .map_err(|e| AquamanError::BackendUnavailable(e.to_string()))?
                    .ok_or_else(|| {
                        AquamanError::OAuthExchange(format!(
                            "missing credential {service}/{key} for token exchange"
                        ))
                    })
            }
        };

        let client_id = fetch(settings.client_id_key.clone()).await?;
        let client_secret = fetch(settings.client_secret_key.clone()).await?;
        let token_url = resolve_placeholders(&settings.token_url, service, store).await?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        if let Some(scope) = &settings.scope {
            form.push(("scope", scope.as_str()));
        }
        if let Some(audience) = &settings.audience {
            form.push(("audience", audience.as_str()));
        }

        let response = self
            .http
            .post(&token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AquamanError::OAuthExchange(format!("token endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(200).collect();
            return Err(AquamanError::OAuthExchange(format!(
                "token endpoint returned {status}: {truncated}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AquamanError::OAuthExchange(format!("malformed token response: {e}")))?;

        Ok((parsed.access_token, parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)))
    }

    /// Drop the cached token for one service.
    pub async fn invalidate(&self, service: &str) {
        self.entries.lock().await.remove(service);
    }

    /// Drop every cached token.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// Substitute every `{key}` placeholder in `template` with the credential
/// stored under `(service, key)`. A missing value aborts, naming the key.
async fn resolve_placeholders(
    template: &str,
    service: &str,
    store: &Arc<dyn CredentialStore>,
) -> Result<String, AquamanError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            // Unterminated brace; emit verbatim.
            out.push_str(rest);
            return Ok(out);
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 1..start + len];
        let value = store
            .get(service, key)
            .await
            .map_err(|e| AquamanError::BackendUnavailable(e.to_string()))?
            .ok_or_else(|| {
                AquamanError::OAuthExchange(format!(
                    "token URL references {service}/{key} which is not stored"
                ))
            })?;
        out.push_str(&value);
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquaman_store::memory::MemoryStore;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(token_url: String) -> OAuthSettings {
        OAuthSettings {
            token_url,
            client_id_key: "client_id".into(),
            client_secret_key: "client_secret".into(),
            scope: Some("https://graph.microsoft.com/.default".into()),
            audience: None,
        }
    }

    async fn seeded_store() -> Arc<dyn CredentialStore> {
        let store = MemoryStore::new();
        store.set("ms-teams", "client_id", "cid-1", None).await.unwrap();
        store.set("ms-teams", "client_secret", "cs-2", None).await.unwrap();
        store.set("ms-teams", "tenant_id", "tid-3", None).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn exchange_posts_form_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tid-3/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=cid-1"))
            .and(body_string_contains("client_secret=cs-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-xyz",
                "token_type": "Bearer",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = seeded_store().await;
        let cache = OAuthTokenCache::new(reqwest::Client::new());
        let settings = settings(format!("{}/{{tenant_id}}/oauth2/v2.0/token", server.uri()));

        // Three lookups inside the validity window: one POST.
        for _ in 0..3 {
            let token = cache.access_token("ms-teams", &settings, &store).await.unwrap();
            assert_eq!(token, "at-xyz");
        }
    }

    #[tokio::test]
    async fn missing_client_secret_names_the_key() {
        let store = MemoryStore::new();
        store.set("ms-teams", "client_id", "cid", None).await.unwrap();
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        let cache = OAuthTokenCache::new(reqwest::Client::new());
        let err = cache
            .access_token("ms-teams", &settings("https://login.example/token".into()), &store)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ms-teams/client_secret"));
    }

    #[tokio::test]
    async fn missing_placeholder_value_names_the_key() {
        let store = MemoryStore::new();
        store.set("ms-teams", "client_id", "cid", None).await.unwrap();
        store.set("ms-teams", "client_secret", "cs", None).await.unwrap();
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        let cache = OAuthTokenCache::new(reqwest::Client::new());
        let err = cache
            .access_token(
                "ms-teams",
                &settings("https://login.example/{tenant_id}/token".into()),
                &store,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tenant_id"));
    }

    #[tokio::test]
    async fn non_2xx_surfaces_status_and_truncated_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(5000)))
            .mount(&server)
            .await;

        let store = seeded_store().await;
        let cache = OAuthTokenCache::new(reqwest::Client::new());
        let err = cache
            .access_token("ms-teams", &settings(format!("{}/token", server.uri())), &store)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("400"));
        assert!(message.len() < 400, "body must be truncated, got {} chars", message.len());
    }

    #[tokio::test]
    async fn expired_token_triggers_a_fresh_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short-lived",
                "expires_in": 1
            })))
            .expect(2)
            .mount(&server)
            .await;

        let store = seeded_store().await;
        // refresh buffer of 60s makes a 1s token immediately stale.
        let cache = OAuthTokenCache::with_limits(reqwest::Client::new(), 128, Duration::from_secs(60));
        let settings = settings(format!("{}/token", server.uri()));

        cache.access_token("ms-teams", &settings, &store).await.unwrap();
        cache.access_token("ms-teams", &settings, &store).await.unwrap();
    }

    #[tokio::test]
    async fn invalidate_forces_reexchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;

        let store = seeded_store().await;
        let cache = OAuthTokenCache::new(reqwest::Client::new());
        let settings = settings(format!("{}/token", server.uri()));

        cache.access_token("ms-teams", &settings, &store).await.unwrap();
        cache.invalidate("ms-teams").await;
        cache.access_token("ms-teams", &settings, &store).await.unwrap();
    }

    #[tokio::test]
    async fn cache_evicts_soonest_expiring_when_full() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        for svc in ["a", "b", "c"] {
            store.set(svc, "client_id", "cid", None).await.unwrap();
            store.set(svc, "client_secret", "cs", None).await.unwrap();
        }
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        let cache = OAuthTokenCache::with_limits(reqwest::Client::new(), 2, Duration::from_secs(60));
        let settings = settings(format!("{}/token", server.uri()));

        cache.access_token("a", &settings, &store).await.unwrap();
        cache.access_token("b", &settings, &store).await.unwrap();
        cache.access_token("c", &settings, &store).await.unwrap();

        let entries = cache.entries.lock().await;
        assert!(entries.len() <= 2);
        assert!(entries.contains_key("c"));
    }

    #[tokio::test]
    async fn resolve_placeholders_handles_multiple_keys() {
        let store = MemoryStore::new();
        store.set("svc", "region", "eu", None).await.unwrap();
        store.set("svc", "tenant", "t1", None).await.unwrap();
        let store: Arc<dyn CredentialStore> = Arc::new(store);

        let resolved =
            resolve_placeholders("https://{region}.example/{tenant}/token", "svc", &store)
                .await
                .unwrap();
        assert_eq!(resolved, "https://eu.example/t1/token");
    }
}
