use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::naming;

/// How a credential enters the upstream request.
///
/// A closed set: the pipeline branches once per request on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// Credential goes into a named request header.
    Header,
    /// Credential is substituted into the URL path (`{token}` placeholder).
    UrlPath,
    /// HTTP Basic: primary credential is the username, first additional key
    /// is the password.
    Basic,
    /// Client-credentials OAuth: a short-lived bearer token is exchanged and
    /// cached, then injected as a header.
    Oauth,
    /// Credential is stored but never proxied. Requests are rejected.
    None,
}

/// One extra header injected alongside the primary credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditionalHeader {
    pub credential_key: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Client-credentials exchange settings for `oauth` mode services.
///
/// `token_url` may contain `{key}` placeholders resolved against the
/// credential store at exchange time (e.g. a tenant id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub token_url: String,
    pub client_id_key: String,
    pub client_secret_key: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// One upstream API known to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Unique name, `^[a-z0-9][a-z0-9._-]*$`. Doubles as the URL path prefix.
    pub name: String,

    /// Absolute http(s) base URL of the upstream API.
    pub upstream: String,

    pub auth_mode: AuthMode,

    /// Header to inject for `header` mode; optional for `oauth` mode
    /// (defaults to `Authorization`).
    #[serde(default)]
    pub auth_header: Option<String>,

    /// Literal prefix prepended to the injected value, e.g. `"Bearer "`.
    #[serde(default)]
    pub auth_prefix: Option<String>,

    /// Primary key the credential is stored under.
    pub credential_key: String,

    /// Ordered extra keys; for `basic` mode the first one is the password.
    #[serde(default)]
    pub additional_credential_keys: Vec<String>,

    /// Extra headers injected with fetched credentials. Missing credentials
    /// omit the header silently.
    #[serde(default)]
    pub additional_headers: BTreeMap<String, AdditionalHeader>,

    /// Path template for `url-path` mode; must contain `{token}`.
    #[serde(default)]
    pub auth_path_template: Option<String>,

    /// Exchange settings, required for `oauth` mode.
    #[serde(default)]
    pub oauth: Option<OAuthSettings>,

    /// Hostnames (or `*.domain` wildcards) this service answers for, used to
    /// build the interceptor host map.
    #[serde(default)]
    pub host_patterns: Vec<String>,
}

impl ServiceDefinition {
    /// Validate internal consistency. Called on every user-supplied entry;
    /// built-ins are covered by tests.
    pub fn validate(&self) -> Result<(), crate::AquamanError> {
        naming::validate_service_name(&self.name)?;
        naming::validate_key(&self.credential_key)?;
        for key in &self.additional_credential_keys {
            naming::validate_key(key)?;
        }
        for header in self.additional_headers.values() {
            naming::validate_key(&header.credential_key)?;
        }

        let url: http::Uri = self.upstream.parse().map_err(|_| {
            crate::AquamanError::InvalidInput(format!(
                "service {}: upstream is not a valid URL",
                self.name
            ))
        })?;
        match url.scheme_str() {
            Some("http") | Some("https") => {}
            _ => {
                return Err(crate::AquamanError::InvalidInput(format!(
                    "service {}: upstream must be absolute http(s)",
                    self.name
                )));
            }
        }

        match self.auth_mode {
            AuthMode::UrlPath => {
                let template = self.auth_path_template.as_deref().unwrap_or("");
                if !template.contains("{token}") {
                    return Err(crate::AquamanError::InvalidInput(format!(
                        "service {}: url-path mode requires an auth_path_template with {{token}}",
                        self.name
                    )));
                }
            }
            AuthMode::Header => {
                if self.auth_header.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::AquamanError::InvalidInput(format!(
                        "service {}: header mode requires auth_header",
                        self.name
                    )));
                }
            }
            AuthMode::Oauth => {
                if self.oauth.is_none() {
                    return Err(crate::AquamanError::InvalidInput(format!(
                        "service {}: oauth mode requires oauth settings",
                        self.name
                    )));
                }
            }
            AuthMode::Basic | AuthMode::None => {}
        }

        Ok(())
    }

    /// Header the proxy injects (and strips from the client request).
    /// `None` for `url-path` mode.
    pub fn effective_auth_header(&self) -> Option<&str> {
        match self.auth_mode {
            AuthMode::Header => self.auth_header.as_deref(),
            AuthMode::Basic => Some("authorization"),
            AuthMode::Oauth => Some(self.auth_header.as_deref().unwrap_or("authorization")),
            AuthMode::UrlPath | AuthMode::None => None,
        }
    }
}

/// Compiled-in service definitions.
///
/// These are protected: the registry never lets a user entry shadow one.
pub fn builtin_services() -> Vec<ServiceDefinition> {
    fn def(name: &str, upstream: &str, auth_mode: AuthMode, credential_key: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: name.into(),
            upstream: upstream.into(),
            auth_mode,
            auth_header: None,
            auth_prefix: None,
            credential_key: credential_key.into(),
            additional_credential_keys: Vec::new(),
            additional_headers: BTreeMap::new(),
            auth_path_template: None,
            oauth: None,
            host_patterns: Vec::new(),
        }
    }

    let mut anthropic = def("anthropic", "https://api.anthropic.com", AuthMode::Header, "api_key");
    anthropic.auth_header = Some("x-api-key".into());
    anthropic.host_patterns = vec!["api.anthropic.com".into()];

    let mut openai = def("openai", "https://api.openai.com", AuthMode::Header, "api_key");
    openai.auth_header = Some("Authorization".into());
    openai.auth_prefix = Some("Bearer ".into());
    openai.host_patterns = vec!["api.openai.com".into()];

    let mut gemini = def(
        "gemini",
        "https://generativelanguage.googleapis.com",
        AuthMode::Header,
        "api_key",
    );
    gemini.auth_header = Some("x-goog-api-key".into());
    gemini.host_patterns = vec!["generativelanguage.googleapis.com".into()];

    let mut github = def("github", "https://api.github.com", AuthMode::Header, "token");
    github.auth_header = Some("Authorization".into());
    github.auth_prefix = Some("Bearer ".into());
    github.host_patterns = vec!["api.github.com".into()];

    let mut slack = def("slack", "https://slack.com/api", AuthMode::Header, "bot_token");
    slack.auth_header = Some("Authorization".into());
    slack.auth_prefix = Some("Bearer ".into());
    slack.host_patterns = vec!["slack.com".into(), "*.slack.com".into()];

    let mut telegram = def("telegram", "https://api.telegram.org", AuthMode::UrlPath, "bot_token");
    telegram.auth_path_template = Some("/bot{token}".into());
    telegram.host_patterns = vec!["api.telegram.org".into()];

    let mut twilio = def("twilio", "https://api.twilio.com", AuthMode::Basic, "account_sid");
    twilio.additional_credential_keys = vec!["auth_token".into()];
    twilio.host_patterns = vec!["api.twilio.com".into()];

    let mut ms_teams = def("ms-teams", "https://graph.microsoft.com", AuthMode::Oauth, "client_id");
    ms_teams.oauth = Some(OAuthSettings {
        token_url: "https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token".into(),
        client_id_key: "client_id".into(),
        client_secret_key: "client_secret".into(),
        scope: Some("https://graph.microsoft.com/.default".into()),
        audience: None,
    });
    ms_teams.host_patterns = vec!["graph.microsoft.com".into()];

    vec![anthropic, openai, gemini, github, slack, telegram, twilio, ms_teams]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_all_validate() {
        for svc in builtin_services() {
            svc.validate().unwrap_or_else(|e| panic!("builtin {}: {e}", svc.name));
        }
    }

    #[test]
    fn builtin_names_are_unique() {
        let builtins = builtin_services();
        let mut names: Vec<_> = builtins.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), builtins.len());
    }

    #[test]
    fn auth_mode_serializes_kebab_case() {
        assert_eq!(serde_json::to_value(AuthMode::UrlPath).unwrap(), "url-path");
        assert_eq!(serde_json::to_value(AuthMode::Header).unwrap(), "header");
        let mode: AuthMode = serde_json::from_value(serde_json::json!("oauth")).unwrap();
        assert_eq!(mode, AuthMode::Oauth);
    }

    #[test]
    fn url_path_mode_requires_token_placeholder() {
        let mut svc = builtin_services()
            .into_iter()
            .find(|s| s.name == "telegram")
            .unwrap();
        svc.auth_path_template = Some("/bot".into());
        assert!(svc.validate().is_err());
    }

    #[test]
    fn upstream_must_be_http_or_https() {
        let mut svc = builtin_services().remove(0);
        svc.upstream = "ftp://example.com".into();
        assert!(svc.validate().is_err());
        svc.upstream = "not a url at all".into();
        assert!(svc.validate().is_err());
    }

    #[test]
    fn effective_auth_header_per_mode() {
        let builtins = builtin_services();
        let anthropic = builtins.iter().find(|s| s.name == "anthropic").unwrap();
        assert_eq!(anthropic.effective_auth_header(), Some("x-api-key"));

        let twilio = builtins.iter().find(|s| s.name == "twilio").unwrap();
        assert_eq!(twilio.effective_auth_header(), Some("authorization"));

        let ms_teams = builtins.iter().find(|s| s.name == "ms-teams").unwrap();
        assert_eq!(ms_teams.effective_auth_header(), Some("authorization"));

        let telegram = builtins.iter().find(|s| s.name == "telegram").unwrap();
        assert_eq!(telegram.effective_auth_header(), None);
    }

    #[test]
    fn definition_roundtrips_through_yaml() {
        let svc = builtin_services().into_iter().find(|s| s.name == "ms-teams").unwrap();
        let yaml = serde_yaml::to_string(&svc).unwrap();
        let decoded: ServiceDefinition = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(decoded.name, "ms-teams");
        assert_eq!(decoded.auth_mode, AuthMode::Oauth);
        assert!(decoded.oauth.unwrap().token_url.contains("{tenant_id}"));
    }
}
