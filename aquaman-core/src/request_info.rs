use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One record per proxied request, handed to the audit sink once the final
/// status is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Collision-free id: process-monotonic counter plus a random component.
    pub id: String,
    pub service: String,
    pub method: String,
    pub path: String,
    /// RFC 3339 UTC, captured when the request entered the pipeline.
    pub timestamp: String,
    /// Whether the credential lookup succeeded.
    pub authenticated: bool,
    /// Final HTTP status returned to the client.
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a request id: `req-<seq>-<uuid4>`.
///
/// The counter alone orders requests within a process; the random component
/// keeps ids unique across restarts.
pub fn next_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{seq}-{}", uuid::Uuid::new_v4().simple())
}

impl RequestInfo {
    pub fn new(service: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: next_request_id(),
            service: service.into(),
            method: method.into(),
            path: path.into(),
            timestamp: Utc::now().to_rfc3339(),
            authenticated: false,
            status_code: 0,
            error: None,
        }
    }
}
