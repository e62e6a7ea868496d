use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the Aquaman daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AquamanConfig {
    /// Listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Forwarding behavior
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Client-token gate for co-located callers
    #[serde(default)]
    pub client_auth: ClientAuthConfig,

    /// Credential store backend selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Audit log location
    #[serde(default)]
    pub audit: AuditConfig,

    /// Service registry sources and allow-list
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Print a one-shot ready line to stdout for a managing host process
    #[serde(default)]
    pub plugin_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind host for TCP mode
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; 0 asks the OS for a free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, serve HTTP over this Unix socket instead of TCP
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// TLS cert/key paths; both set switches the TCP listener to HTTPS
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream request timeout (milliseconds)
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,

    /// Grace period for in-flight handlers during shutdown (milliseconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    /// Require the client token on every proxied request
    #[serde(default)]
    pub enabled: bool,

    /// Expected token; when auth is enabled and this is unset, the daemon
    /// generates one at startup and reports it via the ready line
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub encrypted_file: EncryptedFileConfig,

    #[serde(default)]
    pub op: OpCliConfig,

    #[serde(default)]
    pub vault: VaultConfig,
}

/// Which credential store backend the daemon talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Process-memory map. Tests and explicit opt-in only.
    Memory,
    /// Password-encrypted file under the per-user data directory.
    #[default]
    EncryptedFile,
    /// Host OS credential store.
    Keyring,
    /// 1Password CLI (`op`).
    Op,
    /// HashiCorp Vault KV v2 over REST.
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedFileConfig {
    /// Store file path; defaults to `<data-dir>/aquaman/credentials.enc`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Environment variable holding the store password
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpCliConfig {
    /// Vault (1Password's container, not HashiCorp) items live in
    #[serde(default = "default_op_vault")]
    pub vault: String,

    /// Tag applied to every item; list operations filter on it
    #[serde(default = "default_op_tag")]
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Server address, e.g. `https://vault.internal:8200`
    #[serde(default = "default_vault_address")]
    pub address: String,

    /// KV v2 mount
    #[serde(default = "default_vault_mount")]
    pub mount: String,

    /// Path prefix under the mount
    #[serde(default = "default_vault_prefix")]
    pub prefix: String,

    /// Environment variable holding the Vault token
    #[serde(default = "default_vault_token_env")]
    pub token_env: String,

    /// Optional namespace header
    #[serde(default)]
    pub namespace: Option<String>,

    /// Request timeout (milliseconds)
    #[serde(default = "default_vault_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory holding `current.jsonl` plus rotated archives;
    /// defaults to `<data-dir>/aquaman/audit`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Optional YAML file with user-defined services
    #[serde(default)]
    pub services_file: Option<PathBuf>,

    /// Services the daemon will proxy; unset means every registered service
    #[serde(default)]
    pub allowed_services: Option<Vec<String>>,
}

impl AquamanConfig {
    /// Load configuration from a YAML file merged with `AQUAMAN_`-prefixed
    /// environment variables (`AQUAMAN_LISTEN__PORT`, ...).
    pub fn load(config_path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["aquaman.yaml", "/etc/aquaman/aquaman.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("AQUAMAN_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Resolved encrypted-store path.
    pub fn encrypted_file_path(&self) -> PathBuf {
        self.store.encrypted_file.path.clone().unwrap_or_else(|| {
            data_dir().join("credentials.enc")
        })
    }

    /// Resolved audit directory.
    pub fn audit_dir(&self) -> PathBuf {
        self.audit.dir.clone().unwrap_or_else(|| data_dir().join("audit"))
    }
}

/// Per-user data directory for aquaman state.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aquaman")
}

// Default implementations

impl Default for AquamanConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            proxy: ProxyConfig::default(),
            client_auth: ClientAuthConfig::default(),
            store: StoreConfig::default(),
            audit: AuditConfig::default(),
            registry: RegistryConfig::default(),
            plugin_mode: false,
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            socket_path: None,
            tls: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_ms: default_upstream_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for ClientAuthConfig {
    fn default() -> Self {
        Self { enabled: false, token: None }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            encrypted_file: EncryptedFileConfig::default(),
            op: OpCliConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

impl Default for EncryptedFileConfig {
    fn default() -> Self {
        Self {
            path: None,
            password_env: default_password_env(),
        }
    }
}

impl Default for OpCliConfig {
    fn default() -> Self {
        Self {
            vault: default_op_vault(),
            tag: default_op_tag(),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: default_vault_address(),
            mount: default_vault_mount(),
            prefix: default_vault_prefix(),
            token_env: default_vault_token_env(),
            namespace: None,
            timeout_ms: default_vault_timeout(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { dir: None }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            services_file: None,
            allowed_services: None,
        }
    }
}

// Serde default functions

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_upstream_timeout() -> u64 {
    30_000
}

fn default_shutdown_grace() -> u64 {
    5_000
}

fn default_password_env() -> String {
    "AQUAMAN_STORE_PASSWORD".to_string()
}

fn default_op_vault() -> String {
    "aquaman".to_string()
}

fn default_op_tag() -> String {
    "aquaman".to_string()
}

fn default_vault_address() -> String {
    "http://127.0.0.1:8200".to_string()
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_vault_prefix() -> String {
    "aquaman".to_string()
}

fn default_vault_token_env() -> String {
    "VAULT_TOKEN".to_string()
}

fn default_vault_timeout() -> u64 {
    5_000
}
