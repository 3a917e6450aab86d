//! Multi-tenant configuration.
//!
//! Loaded once at startup from environment variables and validated before
//! any component is built. Durations are kept in minutes to match the
//! variable names operators already use.

use crate::error::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default identity provider authority.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Default management-plane endpoint.
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Default directory for credential files (memory-backed on Linux).
pub const DEFAULT_CREDENTIAL_DIR: &str = "/dev/shm";

// ============================================================================
// CLIENT CREDENTIAL
// ============================================================================

/// The confidential-client credential used for on-behalf-of exchanges.
///
/// Exactly one kind is configured per process.
#[derive(Clone)]
pub enum ClientCredential {
    /// Shared client secret
    Secret(SecretString),
    /// PEM bundle holding the RSA private key and the certificate
    Certificate(SecretString),
}

impl ClientCredential {
    pub fn secret(value: impl Into<String>) -> Self {
        let value: String = value.into();
        Self::Secret(SecretString::new(value.into()))
    }

    pub fn certificate_pem(pem: impl Into<String>) -> Self {
        let pem: String = pem.into();
        Self::Certificate(SecretString::new(pem.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientCredential::Secret(_) => "client_secret",
            ClientCredential::Certificate(_) => "client_certificate",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            ClientCredential::Secret(s) | ClientCredential::Certificate(s) => {
                s.expose_secret().trim().is_empty()
            }
        }
    }
}

impl std::fmt::Debug for ClientCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientCredential::{}([REDACTED])", self.kind())
    }
}

// ============================================================================
// CONFIGURATION SECTIONS
// ============================================================================

/// Confidential client and endpoint settings.
#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub credential: ClientCredential,
    pub authority: String,
    pub management_endpoint: String,
    pub http_timeout: Duration,
}

/// Cache sizing and freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// Upper bound on how long a management token is cached.
    pub token_ttl_minutes: i64,
    /// Entry bound for each LRU cache.
    pub max_cache_size: u64,
    /// Entries this close to expiry are treated as expired.
    pub safety_buffer_minutes: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            token_ttl_minutes: 60,
            max_cache_size: 1000,
            safety_buffer_minutes: 1,
        }
    }
}

impl CacheSettings {
    pub fn token_ttl_ms(&self) -> i64 {
        self.token_ttl_minutes.saturating_mul(60_000)
    }

    pub fn safety_buffer_ms(&self) -> i64 {
        self.safety_buffer_minutes.saturating_mul(60_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuritySettings {
    /// When set, only these subscriptions may be addressed.
    pub allowed_subscriptions: Option<HashSet<String>>,
    pub audit_log_enabled: bool,
    /// Upper bound on a session entry's lifetime.
    pub max_kubeconfig_age_minutes: i64,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_subscriptions: None,
            audit_log_enabled: false,
            max_kubeconfig_age_minutes: 30,
        }
    }
}

impl SecuritySettings {
    pub fn max_kubeconfig_age_ms(&self) -> i64 {
        self.max_kubeconfig_age_minutes.saturating_mul(60_000)
    }

    pub fn is_subscription_allowed(&self, subscription_id: &str) -> bool {
        self.allowed_subscriptions
            .as_ref()
            .map_or(true, |allowed| allowed.contains(subscription_id))
    }
}

/// Where and how credential files are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub credential_dir: PathBuf,
    /// Re-check the embedded token before reusing an existing file.
    pub verify_reused_content: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            credential_dir: PathBuf::from(DEFAULT_CREDENTIAL_DIR),
            verify_reused_content: true,
        }
    }
}

// ============================================================================
// MULTI-TENANT CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct MultiTenantConfig {
    pub azure: AzureConfig,
    pub cache: CacheSettings,
    pub security: SecuritySettings,
    pub storage: StorageSettings,
}

impl MultiTenantConfig {
    /// Build a config with defaults for everything except the client identity.
    pub fn new(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        credential: ClientCredential,
    ) -> Self {
        Self {
            azure: AzureConfig {
                client_id: client_id.into(),
                tenant_id: tenant_id.into(),
                credential,
                authority: DEFAULT_AUTHORITY.to_string(),
                management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
                http_timeout: Duration::from_secs(30),
            },
            cache: CacheSettings::default(),
            security: SecuritySettings::default(),
            storage: StorageSettings::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `AZURE_CLIENT_ID`, `AZURE_TENANT_ID`: confidential client identity (required)
    /// - `AZURE_CLIENT_SECRET`: shared secret
    /// - `AZURE_CLIENT_CERTIFICATE_PATH` / `AZURE_CLIENT_CERTIFICATE`: PEM file or inline PEM
    /// - `AZURE_AUTHORITY_HOST` (default: `https://login.microsoftonline.com`)
    /// - `AZURE_MANAGEMENT_ENDPOINT` (default: `https://management.azure.com`)
    /// - `AZURE_HTTP_TIMEOUT_SECS` (default: 30)
    /// - `CACHE_TOKEN_TTL_MINUTES` (default: 60)
    /// - `CACHE_MAX_SIZE` (default: 1000)
    /// - `CACHE_SAFETY_BUFFER_MINUTES` (default: 1)
    /// - `ALLOWED_SUBSCRIPTIONS`: comma-separated allow-list (default: unrestricted)
    /// - `AUDIT_LOG_ENABLED`: "true" to emit audit events (default: false)
    /// - `MAX_KUBECONFIG_AGE_MINUTES` (default: 30)
    /// - `KUBECONFIG_DIR` (default: `/dev/shm`)
    /// - `VERIFY_REUSED_KUBECONFIG`: "false" for permission-only reuse (default: true)
    ///
    /// Exactly one of the secret or certificate variables must be set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let client_id = var("AZURE_CLIENT_ID").ok_or_else(|| missing("AZURE_CLIENT_ID"))?;
        let tenant_id = var("AZURE_TENANT_ID").ok_or_else(|| missing("AZURE_TENANT_ID"))?;

        let secret = var("AZURE_CLIENT_SECRET");
        let certificate = match (
            var("AZURE_CLIENT_CERTIFICATE_PATH"),
            var("AZURE_CLIENT_CERTIFICATE"),
        ) {
            (Some(path), _) => Some(std::fs::read_to_string(&path).map_err(|e| {
                ConfigError::InvalidValue {
                    field: "AZURE_CLIENT_CERTIFICATE_PATH".to_string(),
                    value: path.clone(),
                    reason: e.to_string(),
                }
            })?),
            (None, inline) => inline,
        };

        let credential = match (secret, certificate) {
            (Some(secret), None) => ClientCredential::secret(secret),
            (None, Some(pem)) => ClientCredential::certificate_pem(pem),
            (Some(_), Some(_)) => {
                return Err(ConfigError::IncompatibleOptions {
                    option_a: "AZURE_CLIENT_SECRET".to_string(),
                    option_b: "AZURE_CLIENT_CERTIFICATE".to_string(),
                })
            }
            (None, None) => return Err(missing("AZURE_CLIENT_SECRET")),
        };

        let mut config = Self::new(client_id, tenant_id, credential);

        if let Some(authority) = var("AZURE_AUTHORITY_HOST") {
            config.azure.authority = authority.trim_end_matches('/').to_string();
        }
        if let Some(endpoint) = var("AZURE_MANAGEMENT_ENDPOINT") {
            config.azure.management_endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_var::<u64>(&var, "AZURE_HTTP_TIMEOUT_SECS")? {
            config.azure.http_timeout = Duration::from_secs(secs);
        }

        if let Some(ttl) = parse_var(&var, "CACHE_TOKEN_TTL_MINUTES")? {
            config.cache.token_ttl_minutes = ttl;
        }
        if let Some(size) = parse_var(&var, "CACHE_MAX_SIZE")? {
            config.cache.max_cache_size = size;
        }
        if let Some(buffer) = parse_var(&var, "CACHE_SAFETY_BUFFER_MINUTES")? {
            config.cache.safety_buffer_minutes = buffer;
        }

        config.security.allowed_subscriptions = var("ALLOWED_SUBSCRIPTIONS").map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });
        config.security.audit_log_enabled = var("AUDIT_LOG_ENABLED")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if let Some(age) = parse_var(&var, "MAX_KUBECONFIG_AGE_MINUTES")? {
            config.security.max_kubeconfig_age_minutes = age;
        }

        if let Some(dir) = var("KUBECONFIG_DIR") {
            config.storage.credential_dir = PathBuf::from(dir);
        }
        config.storage.verify_reused_content = var("VERIFY_REUSED_KUBECONFIG")
            .map(|s| !s.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        config.validate()?;
        Ok(config)
    }

    /// Reject incomplete identity and non-positive limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.azure.client_id.trim().is_empty() {
            return Err(missing("azure.client_id"));
        }
        if self.azure.tenant_id.trim().is_empty() {
            return Err(missing("azure.tenant_id"));
        }
        if self.azure.credential.is_empty() {
            return Err(missing(self.azure.credential.kind()));
        }
        if self.cache.token_ttl_minutes <= 0 {
            return Err(invalid(
                "cache.token_ttl_minutes",
                self.cache.token_ttl_minutes,
                "must be positive",
            ));
        }
        if self.cache.max_cache_size == 0 {
            return Err(invalid("cache.max_cache_size", 0, "must be positive"));
        }
        if self.cache.safety_buffer_minutes < 0 {
            return Err(invalid(
                "cache.safety_buffer_minutes",
                self.cache.safety_buffer_minutes,
                "must not be negative",
            ));
        }
        if self.security.max_kubeconfig_age_minutes <= 0 {
            return Err(invalid(
                "security.max_kubeconfig_age_minutes",
                self.security.max_kubeconfig_age_minutes,
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn missing(field: &str) -> ConfigError {
    ConfigError::MissingRequired {
        field: field.to_string(),
    }
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}
