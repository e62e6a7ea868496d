use thiserror::Error;

/// Unified error type for the Aquaman proxy.
///
/// Every internal failure maps to exactly one client-visible HTTP class via
/// [`AquamanError::status_code`]. Messages never contain credential values or
/// upstream error bodies.
#[derive(Error, Debug)]
pub enum AquamanError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No credential stored for {service}/{key}")]
    CredentialMissing { service: String, key: String },

    #[error("Forbidden")]
    AuthFailure,

    #[error("Service {0} is configured for at-rest storage only")]
    ModeUnsupported(String),

    #[error("Credential backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("OAuth token exchange failed: {0}")]
    OAuthExchange(String),

    #[error("Upstream error")]
    UpstreamConnect(String),

    #[error("Gateway Timeout")]
    UpstreamTimeout,

    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    #[error("Internal: {0}")]
    Internal(String),
}

impl AquamanError {
    /// Map to the HTTP status code the proxy originates for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            AquamanError::InvalidInput(_) => 404,
            AquamanError::NotFound(_) => 404,
            AquamanError::CredentialMissing { .. } => 401,
            AquamanError::AuthFailure => 403,
            AquamanError::ModeUnsupported(_) => 400,
            AquamanError::BackendUnavailable(_) => 500,
            AquamanError::OAuthExchange(_) => 500,
            AquamanError::UpstreamConnect(_) => 502,
            AquamanError::UpstreamTimeout => 504,
            AquamanError::AuditWrite(_) => 500,
            AquamanError::Internal(_) => 500,
        }
    }

    /// Short machine-readable label for audit records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AquamanError::InvalidInput(_) => "invalid_input",
            AquamanError::NotFound(_) => "not_found",
            AquamanError::CredentialMissing { .. } => "credential_missing",
            AquamanError::AuthFailure => "auth_failure",
            AquamanError::ModeUnsupported(_) => "mode_unsupported",
            AquamanError::BackendUnavailable(_) => "backend_unavailable",
            AquamanError::OAuthExchange(_) => "oauth_exchange",
            AquamanError::UpstreamConnect(_) => "upstream_connect",
            AquamanError::UpstreamTimeout => "upstream_timeout",
            AquamanError::AuditWrite(_) => "audit_write",
            AquamanError::Internal(_) => "internal",
        }
    }

    /// JSON error body returned to the client.
    ///
    /// The credential-missing case is the one place operator guidance is safe
    /// to surface: the `fix` field names the exact seeding command.
    pub fn to_json_body(&self) -> String {
        match self {
            AquamanError::CredentialMissing { service, key } => serde_json::json!({
                "error": self.to_string(),
                "fix": format!("Run: aquaman credentials add {service} {key}"),
            })
            .to_string(),
            _ => serde_json::json!({
                "error": self.to_string(),
                "status": self.status_code(),
            })
            .to_string(),
        }
    }
}
