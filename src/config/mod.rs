pub use components::{IdpConfig, KvConfig, LogLevel, RateLimitConfig, TlsConfig};
use serde::{Deserialize, Serialize};
/**
 * Authproxy configuration root module.
 *
 * - Defines the root configuration struct (`AuthProxyConfig`) and its defaults.
 * - Provides config file loading, CLI/env override logic, and error reporting.
 * - Uses `components.rs` for types/enums and `defaults.rs` for default helpers.
 */
use std::path::{Path, PathBuf};
use thiserror::Error;

use components::{BrandingConfig, UpstreamProcessConfig};

pub mod components;
pub mod defaults;

/// Root configuration for the authorizing reverse proxy.
///
/// Field names mirror spec §6 EXTERNAL INTERFACES one-to-one; every name
/// there is both a CLI flag (via `Args` in `main.rs`) and an environment
/// variable understood by `clap`'s `env` attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct AuthProxyConfig {
    /// `BASE_URL` — this proxy's external origin; MUST be an absolute URL.
    pub base_url: String,
    /// `PORT`
    #[serde(default = "defaults::default_port")]
    pub port: u16,
    /// Bind address for the listener (not itself in spec §6, ambient).
    #[serde(default = "defaults::default_bind_address")]
    pub bind_address: String,
    /// `UPSTREAM_SERVER_URL` — full URL (including path) of the proxied resource server.
    pub upstream_server_url: String,
    /// Upstream child-process supervision.
    #[serde(default)]
    pub upstream_process: UpstreamProcessConfig,
    /// Upstream identity provider.
    pub idp: IdpConfig,
    /// `PROXY_SCOPE`
    #[serde(default = "defaults::default_proxy_scope")]
    pub proxy_scope: String,
    /// `OIDC_PROVIDER_JWKS` — JSON array of private JWKs (Ed25519 expected).
    pub oidc_provider_jwks: Option<String>,
    /// KV store connection.
    pub kv: KvConfig,
    /// Rate limiter for the metadata endpoint.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// `LOCAL_INSECURE` — disables the HTTPS redirect when true.
    #[serde(default = "defaults::default_false")]
    pub local_insecure: bool,
    /// `DEPLOYMENT_ENV` — must be exactly `"production"` to disable the PKCE fallback (I6).
    #[serde(default = "defaults::default_deployment_env")]
    pub deployment_env: String,
    /// TLS configuration for the proxy's own listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// `BRANDING_*` — outside the core, template-only.
    #[serde(default)]
    pub branding: BrandingConfig,
    /// Upstream HTTP timeout in seconds (§5, default 30s).
    #[serde(default = "defaults::default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

impl AuthProxyConfig {
    /// Build a config purely from required fields, filling everything else
    /// with the same defaults `serde` would apply to an otherwise-empty YAML
    /// document. Used by `main.rs` when no config file is present.
    pub fn from_required(
        base_url: String,
        upstream_server_url: String,
        idp: IdpConfig,
        kv: KvConfig,
    ) -> Self {
        Self {
            base_url,
            port: defaults::default_port(),
            bind_address: defaults::default_bind_address(),
            upstream_server_url,
            upstream_process: UpstreamProcessConfig::default(),
            idp,
            proxy_scope: defaults::default_proxy_scope(),
            oidc_provider_jwks: None,
            kv,
            rate_limit: RateLimitConfig::default(),
            local_insecure: defaults::default_false(),
            deployment_env: defaults::default_deployment_env(),
            tls: None,
            branding: BrandingConfig::default(),
            upstream_timeout_secs: defaults::default_upstream_timeout_secs(),
        }
    }

    /// Returns true iff `deployment_env` is exactly `"production"` (case-sensitive, I6).
    pub fn is_production(&self) -> bool {
        self.deployment_env == "production"
    }

    /// Compute the default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(override_path) = std::env::var_os("AUTHPROXY_CONFIG_PATH") {
            return PathBuf::from(override_path);
        }
        if cfg!(target_os = "windows") {
            let home = std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .unwrap_or_default();
            let mut p = PathBuf::from(home);
            p.push("authproxy");
            p.push("config");
            p
        } else {
            PathBuf::from("/").join("etc").join("authproxy").join("config")
        }
    }

    /// Load config from an optional YAML file, falling back to defaults for
    /// everything not present. Values the caller passes explicitly (CLI/env,
    /// via `clap`) should be applied on top of the returned value by `main.rs`.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or_else(Self::default_path);

        if path.exists() {
            tracing::debug!("Reading configuration file {:?}", path);
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Parse(path.clone(), format!("I/O error: {}", e)))?;
            Self::parse_yaml_with_path(&path, &text)
        } else {
            Err(ConfigError::Missing(path))
        }
    }

    fn parse_yaml_with_path(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str::<Self>(text).map_err(|e| {
            let msg = if let Some(loc) = e.location() {
                format!(
                    "yaml error at line {}, column {}: {}",
                    loc.line(),
                    loc.column(),
                    e
                )
            } else {
                format!("yaml error: {}", e)
            };
            ConfigError::Parse(path.to_path_buf(), msg)
        })
    }

    /// Validate invariants that must hold before the proxy can bind a
    /// listener. Violations are fatal at startup (§6 Exit codes, §7
    /// `ConfigurationError`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("BASE_URL is not an absolute URL: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(ConfigError::Invalid(
                "BASE_URL must be an absolute URL".to_string(),
            ));
        }
        url::Url::parse(&self.upstream_server_url).map_err(|e| {
            ConfigError::Invalid(format!("UPSTREAM_SERVER_URL is not an absolute URL: {}", e))
        })?;
        if self.idp.server_url.is_empty() {
            return Err(ConfigError::Invalid(
                "IDP_SERVER_URL must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors during configuration loading/parsing/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse {0}: {1}")]
    Parse(PathBuf, String),
    #[error("Configuration file not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
