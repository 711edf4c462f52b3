use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use convobridge_transport_protocol::subscriptions;

use crate::cache::CachePolicy;
use crate::console::ConsoleConfig;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load and validate a config file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config = Self::parse(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML after expanding `${VAR}` references.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reliability;
        if r.max_pairing_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reliability.max_pairing_attempts must be > 0".to_string(),
            ));
        }
        for (name, value) in [
            ("poll_interval_seconds", r.poll_interval_seconds),
            ("notify_interval_seconds", r.notify_interval_seconds),
            ("pairing_expiry_seconds", r.pairing_expiry_seconds),
            ("session_create_timeout_seconds", r.session_create_timeout_seconds),
            ("challenge_wait_seconds", r.challenge_wait_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "reliability.{name} must be > 0"
                )));
            }
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.trim().is_empty() {
                return Err(ConfigError::Invalid("tenant id must not be empty".to_string()));
            }
            if tenant.id.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "tenant id '{}' must not contain '/'",
                    tenant.id
                )));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tenant id '{}'",
                    tenant.id
                )));
            }
            tenant
                .console
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("tenant '{}': {e}", tenant.id)))?;
        }
        Ok(())
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    256
}

fn default_sidecar_url() -> String {
    "http://127.0.0.1:4000".to_string()
}

fn default_sidecar_timeout() -> u64 {
    10
}

fn default_subscriptions() -> Vec<String> {
    subscriptions::defaults()
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand `${VAR}`, `${VAR:-default}` and `$$` in config text.
///
/// A `$` not followed by `{` or `$` is kept literally. Defaults are taken
/// verbatim; nested references inside a default are not expanded.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or(ConfigError::UnclosedVarReference)?;
            out.push_str(&resolve_reference(&body[..end])?);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve the inside of a `${...}` reference.
fn resolve_reference(reference: &str) -> Result<String, ConfigError> {
    let (name, default) = match reference.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (reference, None),
    };

    match (std::env::var(name), default) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(default)) => Ok(default.to_string()),
        (Err(_), None) => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer token required on `/api/v1` when set.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            max_connections: default_max_connections(),
            api_token: None,
        }
    }
}

// ============================================================================
// TransportConfig
// ============================================================================

/// Where the transport sidecar lives.
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_sidecar_url")]
    pub sidecar_url: String,
    #[serde(default = "default_sidecar_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sidecar_url: default_sidecar_url(),
            request_timeout_seconds: default_sidecar_timeout(),
        }
    }
}

// ============================================================================
// ReliabilityConfig
// ============================================================================

/// Timers and budgets of the reliability core, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    /// How often a disconnected tenant's session is polled.
    pub poll_interval_seconds: u64,
    /// How often the console is reminded of an ongoing outage.
    pub notify_interval_seconds: u64,
    /// Lifetime of a forwarded pairing challenge.
    pub pairing_expiry_seconds: u64,
    /// Pairing attempts allowed per outage episode.
    pub max_pairing_attempts: u32,
    /// Bounded wait for session creation during pairing bootstrap.
    pub session_create_timeout_seconds: u64,
    /// How long to wait for the session to emit a challenge.
    pub challenge_wait_seconds: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            notify_interval_seconds: 300,
            pairing_expiry_seconds: 30,
            max_pairing_attempts: 5,
            session_create_timeout_seconds: 10,
            challenge_wait_seconds: 20,
        }
    }
}

/// [`ReliabilityConfig`] converted to durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub poll_interval: Duration,
    pub notify_interval: Duration,
    pub pairing_expiry: Duration,
    pub max_pairing_attempts: u32,
    pub session_create_timeout: Duration,
    pub challenge_wait: Duration,
}

impl From<&ReliabilityConfig> for Timings {
    fn from(c: &ReliabilityConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(c.poll_interval_seconds),
            notify_interval: Duration::from_secs(c.notify_interval_seconds),
            pairing_expiry: Duration::from_secs(c.pairing_expiry_seconds),
            max_pairing_attempts: c.max_pairing_attempts,
            session_create_timeout: Duration::from_secs(c.session_create_timeout_seconds),
            challenge_wait: Duration::from_secs(c.challenge_wait_seconds),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&ReliabilityConfig::default())
    }
}

// ============================================================================
// CacheConfig
// ============================================================================

/// TTL policy for one cache namespace.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CacheStoreConfig {
    pub ttl_seconds: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
}

impl CacheStoreConfig {
    const fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            max_entries: None,
        }
    }

    pub fn policy(&self) -> CachePolicy {
        let policy = CachePolicy::new(Duration::from_secs(self.ttl_seconds));
        match self.max_entries {
            Some(max) => policy.with_max_entries(max),
            None => policy,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub lookups: CacheStoreConfig,
    pub idempotency: CacheStoreConfig,
    pub throttle: CacheStoreConfig,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lookups: CacheStoreConfig::with_ttl(3600),
            idempotency: CacheStoreConfig::with_ttl(600),
            throttle: CacheStoreConfig::with_ttl(60),
            sweep_interval_seconds: 60,
        }
    }
}

// ============================================================================
// TenantConfig
// ============================================================================

/// A tenant as declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    /// The tenant's own network address, used for self-notification.
    pub identity: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Credential handed to the sidecar when (re)creating the session.
    #[serde(default)]
    pub transport_token: String,
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,
    pub console: ConsoleConfig,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const TENANT_YAML: &str = r#"
tenants:
  - id: acme
    identity: "5511999990000"
    display_name: Acme Support
    transport_token: tok
    console:
      base_url: https://desk.example.com
      account_id: 3
      auth_token: secret
      inbox_name: WhatsApp
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8090);
        assert_eq!(config.transport.sidecar_url, "http://127.0.0.1:4000");
        assert_eq!(config.reliability.poll_interval_seconds, 30);
        assert_eq!(config.reliability.notify_interval_seconds, 300);
        assert_eq!(config.reliability.pairing_expiry_seconds, 30);
        assert_eq!(config.reliability.max_pairing_attempts, 5);
        assert_eq!(config.cache.idempotency.ttl_seconds, 600);
        assert!(config.tenants.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing = tmp_dir.path().join("missing.yaml");
        let config = Config::load(&missing).await.unwrap();
        assert_eq!(config.server.port, 8090);
    }

    #[tokio::test]
    async fn test_load_tenants() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{TENANT_YAML}").unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.tenants.len(), 1);
        let tenant = &config.tenants[0];
        assert_eq!(tenant.id, "acme");
        assert_eq!(tenant.identity, "5511999990000");
        assert_eq!(tenant.console.account_id, 3);
        assert_eq!(tenant.console.inbox_name, "WhatsApp");
        assert_eq!(tenant.subscriptions, subscriptions::defaults());
    }

    #[tokio::test]
    async fn test_partial_reliability_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
reliability:
  poll_interval_seconds: 5
cache:
  idempotency:
    ttl_seconds: 900
    max_entries: 10000
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.reliability.poll_interval_seconds, 5);
        assert_eq!(config.reliability.notify_interval_seconds, 300);
        let policy = config.cache.idempotency.policy();
        assert_eq!(policy.default_ttl, Duration::from_secs(900));
        assert_eq!(policy.max_entries, Some(10000));
        assert_eq!(config.cache.lookups.ttl_seconds, 3600);
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server: [unclosed").unwrap();
        assert!(matches!(
            Config::load(file.path()).await,
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_tenants() {
        let yaml = format!("{TENANT_YAML}{}", &TENANT_YAML["\ntenants:\n".len()..]);
        let config = Config::parse(&yaml).unwrap();
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_zero_budget() {
        let config = Config {
            reliability: ReliabilityConfig {
                max_pairing_attempts: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_timings_from_config() {
        let timings = Timings::default();
        assert_eq!(timings.poll_interval, Duration::from_secs(30));
        assert_eq!(timings.notify_interval, Duration::from_secs(300));
        assert_eq!(timings.max_pairing_attempts, 5);
    }

    // ========================================================================
    // Environment Variable Expansion Tests
    // ========================================================================

    #[test]
    fn test_expand_env_vars_no_vars() {
        let input = "plain: value";
        assert_eq!(expand_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_expand_env_vars_required_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::set_var("CONVOBRIDGE_TEST_TOKEN", "abc") };
        let result = expand_env_vars("token: ${CONVOBRIDGE_TEST_TOKEN}").unwrap();
        assert_eq!(result, "token: abc");
        unsafe { std::env::remove_var("CONVOBRIDGE_TEST_TOKEN") };
    }

    #[test]
    fn test_expand_env_vars_missing_required_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("CONVOBRIDGE_MISSING_98765") };
        match expand_env_vars("x: ${CONVOBRIDGE_MISSING_98765}") {
            Err(ConfigError::MissingEnvVar(name)) => {
                assert_eq!(name, "CONVOBRIDGE_MISSING_98765")
            }
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn test_expand_env_vars_defaults() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("CONVOBRIDGE_UNSET_PORT") };
        assert_eq!(
            expand_env_vars("port: ${CONVOBRIDGE_UNSET_PORT:-8090}").unwrap(),
            "port: 8090"
        );
        assert_eq!(
            expand_env_vars("key: ${CONVOBRIDGE_UNSET_PORT:-}").unwrap(),
            "key: "
        );
    }

    #[test]
    fn test_expand_env_vars_dollars() {
        assert_eq!(expand_env_vars("price: $100").unwrap(), "price: $100");
        assert_eq!(expand_env_vars("lit: $${X}").unwrap(), "lit: ${X}");
        assert_eq!(expand_env_vars("end$").unwrap(), "end$");
    }

    #[test]
    fn test_expand_env_vars_unclosed_brace() {
        assert!(matches!(
            expand_env_vars("x: ${OPEN"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }
}
