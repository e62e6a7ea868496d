//! The proxy request pipeline.
//!
//! Every incoming request runs the same sequence: dispatch the reserved
//! endpoints, gate on the client token, resolve the service, fetch the
//! credential, rewrite URL and headers for the configured auth mode, stream
//! the exchange with the upstream, and hand a request-info record to the
//! audit sink once the final status is known.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::TryStreamExt;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use aquaman_core::service::{AuthMode, ServiceDefinition};
use aquaman_core::{AquamanError, RequestInfo, ServiceRegistry, naming};
use aquaman_store::CredentialStore;

use crate::oauth::OAuthTokenCache;

/// Header co-located clients authenticate with. Must never reach upstream.
pub const CLIENT_TOKEN_HEADER: &str = "x-aquaman-token";

/// Receives one record per proxied request after the response status is
/// known. Failures inside the sink must not alter the HTTP response.
pub type AuditSink = Arc<dyn Fn(RequestInfo) + Send + Sync>;

pub struct ProxyContext {
    pub registry: Arc<ServiceRegistry>,
    pub store: Arc<dyn CredentialStore>,
    pub oauth: OAuthTokenCache,
    pub client: reqwest::Client,
    /// Cleared on daemon stop; gate disabled when `None`.
    pub client_token: RwLock<Option<String>>,
    pub allowed_services: HashSet<String>,
    pub upstream_timeout: Duration,
    pub started_at: Instant,
    pub sink: AuditSink,
}

impl ProxyContext {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        store: Arc<dyn CredentialStore>,
        sink: AuditSink,
        client_token: Option<String>,
        allowed_services: Option<Vec<String>>,
        upstream_timeout: Duration,
    ) -> Self {
        let allowed: HashSet<String> = match allowed_services {
            Some(list) => list.into_iter().collect(),
            None => registry.names().into_iter().collect(),
        };
        let client = reqwest::Client::new();
        Self {
            registry,
            store,
            oauth: OAuthTokenCache::new(client.clone()),
            client,
            client_token: RwLock::new(client_token),
            allowed_services: allowed,
            upstream_timeout,
            started_at: Instant::now(),
            sink,
        }
    }
}

/// Build the axum router: reserved endpoints first, everything else falls
/// through to the proxy handler.
pub fn build_router(ctx: Arc<ProxyContext>) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/_hostmap", get(hostmap))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

// ── Reserved endpoints ────────────────────────────────────────

async fn health(State(ctx): State<Arc<ProxyContext>>) -> Response {
    let mut services: Vec<&String> = ctx.allowed_services.iter().collect();
    services.sort();
    let body = serde_json::json!({
        "status": "ok",
        "uptime": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "services": services,
    });
    json_response(StatusCode::OK, body.to_string())
}

async fn hostmap(State(ctx): State<Arc<ProxyContext>>) -> Response {
    let map = ctx.registry.build_host_map();
    json_response(
        StatusCode::OK,
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string()),
    )
}

// ── Client-token gate ─────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn provided_client_token<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    headers
        .get(CLIENT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| bearer_token(headers))
}

/// Constant-time token comparison. A length mismatch still performs a
/// compare against a dummy of the provided length so timing does not leak
/// the expected length.
fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    let Some(provided) = provided else {
        return false;
    };
    if provided.len() == expected.len() {
        provided.as_bytes().ct_eq(expected.as_bytes()).into()
    } else {
        let dummy = vec![0u8; provided.len()];
        let _: bool = provided.as_bytes().ct_eq(&dummy).into();
        false
    }
}

// ── Pipeline ──────────────────────────────────────────────────

async fn proxy_handler(State(ctx): State<Arc<ProxyContext>>, request: Request) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    // Gate before anything else; the reserved endpoints never reach the
    // fallback so they stay exempt.
    {
        let expected = ctx.client_token.read().unwrap_or_else(|e| e.into_inner());
        if let Some(expected) = expected.as_deref()
            && !token_matches(expected, provided_client_token(request.headers()))
        {
            warn!(path = %path, "client token mismatch");
            return error_response(&AquamanError::AuthFailure);
        }
    }

    let service_name = match route_service(&ctx, &path) {
        Ok(name) => name,
        Err(e) => return error_response(&e),
    };

    let mut info = RequestInfo::new(service_name.clone(), method, path);
    let response = match run_pipeline(&ctx, &service_name, request, &mut info).await {
        Ok(response) => {
            info.status_code = response.status().as_u16();
            response
        }
        Err(e) => {
            info.status_code = e.status_code();
            info.error = Some(e.kind().to_string());
            error_response(&e)
        }
    };

    (ctx.sink)(info);
    response
}

/// First non-empty path segment, validated and checked against the
/// allow-list. Every miss is a 404: unknown, disallowed, and malformed look
/// identical from outside.
fn route_service(ctx: &ProxyContext, path: &str) -> Result<String, AquamanError> {
    let name = path
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    if !naming::is_safe_name(name) {
        return Err(AquamanError::NotFound("unknown service".into()));
    }
    if !ctx.allowed_services.contains(name) {
        return Err(AquamanError::NotFound(format!("service {name} is not enabled")));
    }
    if !ctx.registry.has(name) {
        return Err(AquamanError::NotFound(format!("service {name} is not registered")));
    }
    Ok(name.to_string())
}

async fn run_pipeline(
    ctx: &ProxyContext,
    service_name: &str,
    request: Request,
    info: &mut RequestInfo,
) -> Result<Response, AquamanError> {
    let service = ctx
        .registry
        .get(service_name)
        .ok_or_else(|| AquamanError::NotFound(format!("service {service_name} is not registered")))?;

    if service.auth_mode == AuthMode::None {
        return Err(AquamanError::ModeUnsupported(service_name.to_string()));
    }

    // ── Primary credential ──
    let credential = ctx
        .store
        .get(service_name, &service.credential_key)
        .await
        .map_err(|e| AquamanError::BackendUnavailable(e.to_string()))?
        .ok_or_else(|| AquamanError::CredentialMissing {
            service: service_name.to_string(),
            key: service.credential_key.clone(),
        })?;
    info.authenticated = true;

    // ── Upstream URL ──
    let remaining = remaining_path(request.uri().path(), service_name);
    let url = build_upstream_url(&service, &credential, &remaining, request.uri().query())?;

    // ── Headers ──
    let headers = build_upstream_headers(ctx, &service, &credential, request.headers()).await?;

    debug!(service = %service_name, url = %url, "forwarding request");

    // ── Forward ──
    let method = request.method().clone();
    let body_stream = request.into_body().into_data_stream();
    let upstream_response = ctx
        .client
        .request(method, &url)
        .headers(headers)
        .timeout(ctx.upstream_timeout)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                AquamanError::UpstreamTimeout
            } else {
                AquamanError::UpstreamConnect(e.to_string())
            }
        })?;

    Ok(stream_response(upstream_response))
}

/// Path left after stripping the service prefix, always `/`-rooted.
fn remaining_path(path: &str, service_name: &str) -> String {
    let rest = path
        .trim_start_matches('/')
        .strip_prefix(service_name)
        .unwrap_or_default();
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

fn build_upstream_url(
    service: &ServiceDefinition,
    credential: &str,
    remaining: &str,
    query: Option<&str>,
) -> Result<String, AquamanError> {
    let upstream_path = match service.auth_mode {
        AuthMode::UrlPath => {
            let template = service.auth_path_template.as_deref().ok_or_else(|| {
                AquamanError::Internal(format!("service {} has no path template", service.name))
            })?;
            let injected = template.replace("{token}", credential);
            format!("{injected}{remaining}")
        }
        _ => remaining.to_string(),
    };

    let base = service.upstream.trim_end_matches('/');
    let mut url = format!("{base}{upstream_path}");
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    Ok(url)
}

/// Copy client headers minus the denylist, then inject per auth mode.
///
/// Denylist over allowlist: upstream APIs rely on custom headers the proxy
/// cannot enumerate. `Authorization` is always stripped, whatever the mode,
/// and the client-token header must never leak upstream.
async fn build_upstream_headers(
    ctx: &ProxyContext,
    service: &ServiceDefinition,
    credential: &str,
    incoming: &HeaderMap,
) -> Result<HeaderMap, AquamanError> {
    let injected_header = service.effective_auth_header();
    let mut headers = HeaderMap::new();

    for (name, value) in incoming {
        if name == &HOST || name == &AUTHORIZATION {
            continue;
        }
        if name.as_str().eq_ignore_ascii_case(CLIENT_TOKEN_HEADER) {
            continue;
        }
        if let Some(auth_header) = injected_header
            && name.as_str().eq_ignore_ascii_case(auth_header)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match service.auth_mode {
        AuthMode::Header => {
            let name = service.auth_header.as_deref().ok_or_else(|| {
                AquamanError::Internal(format!("service {} has no auth header", service.name))
            })?;
            let prefix = service.auth_prefix.as_deref().unwrap_or_default();
            insert_header(&mut headers, name, &format!("{prefix}{credential}"))?;
        }
        AuthMode::Basic => {
            let password_key = service.additional_credential_keys.first();
            let password = match password_key {
                Some(key) => ctx
                    .store
                    .get(&service.name, key)
                    .await
                    .map_err(|e| AquamanError::BackendUnavailable(e.to_string()))?
                    .unwrap_or_default(),
                None => String::new(),
            };
            let encoded = BASE64.encode(format!("{credential}:{password}"));
            insert_header(&mut headers, "authorization", &format!("Basic {encoded}"))?;
        }
        AuthMode::Oauth => {
            let settings = service.oauth.as_ref().ok_or_else(|| {
                AquamanError::Internal(format!("service {} has no oauth settings", service.name))
            })?;
            let token = ctx
                .oauth
                .access_token(&service.name, settings, &ctx.store)
                .await?;
            let name = service.auth_header.as_deref().unwrap_or("authorization");
            let prefix = service.auth_prefix.as_deref().unwrap_or("Bearer ");
            insert_header(&mut headers, name, &format!("{prefix}{token}"))?;
        }
        AuthMode::UrlPath => {}
        AuthMode::None => unreachable!("none mode is rejected before header build"),
    }

    // Optional companion headers; a missing credential omits the header.
    for (name, spec) in &service.additional_headers {
        let value = ctx
            .store
            .get(&service.name, &spec.credential_key)
            .await
            .map_err(|e| AquamanError::BackendUnavailable(e.to_string()))?;
        if let Some(value) = value {
            let prefix = spec.prefix.as_deref().unwrap_or_default();
            insert_header(&mut headers, name, &format!("{prefix}{value}"))?;
        }
    }

    Ok(headers)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), AquamanError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| AquamanError::Internal(format!("invalid header name {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| AquamanError::Internal("credential is not a valid header value".into()))?;
    headers.insert(name, value);
    Ok(())
}

/// Convert the upstream response, streaming the body through. Upstream
/// status and headers pass verbatim except `Transfer-Encoding`, which the
/// server layer re-derives for the outgoing encoding.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);

    for (name, value) in upstream.headers() {
        if name == &TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }

    let body = Body::from_stream(upstream.bytes_stream().map_err(axum::Error::new));
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to assemble upstream response");
        error_response(&AquamanError::Internal("response assembly failed".into()))
    })
}

// ── Responses ─────────────────────────────────────────────────

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

fn error_response(err: &AquamanError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, err.to_json_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquaman_core::service::builtin_services;

    fn service(name: &str) -> ServiceDefinition {
        builtin_services().into_iter().find(|s| s.name == name).unwrap()
    }

    // ── token gate ───────────────────────────────────────────────

    #[test]
    fn token_matches_equal_strings() {
        assert!(token_matches("secret-token", Some("secret-token")));
    }

    #[test]
    fn token_rejects_wrong_value_same_length() {
        assert!(!token_matches("secret-token", Some("secret-tokeX")));
    }

    #[test]
    fn token_rejects_length_mismatch_and_absence() {
        assert!(!token_matches("secret-token", Some("short")));
        assert!(!token_matches("secret-token", None));
    }

    #[test]
    fn client_token_read_from_dedicated_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_TOKEN_HEADER, HeaderValue::from_static("from-header"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(provided_client_token(&headers), Some("from-header"));
    }

    #[test]
    fn client_token_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        assert_eq!(provided_client_token(&headers), Some("from-bearer"));
    }

    // ── URL building ─────────────────────────────────────────────

    #[test]
    fn remaining_path_strips_service_prefix() {
        assert_eq!(remaining_path("/anthropic/v1/messages", "anthropic"), "/v1/messages");
        assert_eq!(remaining_path("/anthropic", "anthropic"), "/");
        assert_eq!(remaining_path("/telegram/getMe", "telegram"), "/getMe");
    }

    #[test]
    fn header_mode_keeps_path_untouched() {
        let svc = service("anthropic");
        let url = build_upstream_url(&svc, "sk-ant-TEST", "/v1/messages", None).unwrap();
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn url_path_mode_substitutes_the_token() {
        let svc = service("telegram");
        let url = build_upstream_url(&svc, "123:ABC", "/getMe", None).unwrap();
        assert_eq!(url, "https://api.telegram.org/bot123:ABC/getMe");
    }

    #[test]
    fn query_string_is_preserved() {
        let svc = service("openai");
        let url = build_upstream_url(&svc, "k", "/v1/models", Some("limit=5")).unwrap();
        assert_eq!(url, "https://api.openai.com/v1/models?limit=5");
    }

    // ── responses ───────────────────────────────────────────────

    #[test]
    fn error_response_carries_json_content_type() {
        let resp = error_response(&AquamanError::UpstreamTimeout);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    }
}
