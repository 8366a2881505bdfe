/// Authproxy configuration components module.
///
/// Defines user-facing configuration structures and enums. It provides
/// helpers for loading, parsing, and applying configuration, serving as the
/// building blocks for the root `AuthProxyConfig` in `mod.rs`.
use super::defaults;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Logging levels supported by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{}", s)
    }
}

/// TLS configuration for the proxy's own listener.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct TlsConfig {
    /// TLS private key path (PEM).
    pub key: Option<String>,
    /// TLS certificate path (PEM).
    pub cert: Option<String>,
}

/// The upstream identity provider this proxy brokers authentication to (C3).
///
/// Corresponds to spec §6 `IDP_*` configuration and §4.2's discovery-or-static
/// initialization choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct IdpConfig {
    /// `IDP_SERVER_URL` — issuer/authority base URL, used for discovery
    /// unless `metadata_file` is set.
    pub server_url: String,
    /// `IDP_CLIENT_ID`
    pub client_id: String,
    /// `IDP_CLIENT_SECRET`
    pub client_secret: String,
    /// `IDP_SCOPE` — space- or comma-separated; split on `[ ,]+`.
    #[serde(default = "defaults::default_idp_scope")]
    pub scope: String,
    /// `IDP_SERVER_METADATA_FILE` — optional static metadata, bypasses discovery.
    #[serde(default)]
    pub metadata_file: Option<String>,
    /// `IDP_CALLBACK_PATH`
    #[serde(default = "defaults::default_idp_callback_path")]
    pub callback_path: String,
    /// `IDP_UNIQUE_CALLBACK_PATH`
    #[serde(default = "defaults::default_idp_unique_callback_path")]
    pub unique_callback_path: String,
}

impl IdpConfig {
    /// Build an `IdpConfig` from just the required fields, filling the rest
    /// with the same defaults `serde` applies to an otherwise-empty block.
    /// Used by `main.rs` when assembling configuration purely from CLI/env,
    /// with no YAML file to deserialize.
    pub fn new(server_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            server_url,
            client_id,
            client_secret,
            scope: defaults::default_idp_scope(),
            metadata_file: None,
            callback_path: defaults::default_idp_callback_path(),
            unique_callback_path: defaults::default_idp_unique_callback_path(),
        }
    }
}

/// Child-process spec for the supervised upstream resource server (C9 collaborator).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct UpstreamProcessConfig {
    /// `UPSTREAM_SERVER_RUN_COMMAND`
    pub run_command: Option<String>,
    /// `UPSTREAM_SERVER_RUN_ARGS_JSON`
    #[serde(default)]
    pub args: Vec<String>,
    /// `UPSTREAM_SERVER_RUN_DIR`
    pub dir: Option<String>,
    /// `UPSTREAM_SERVER_RUN_ENV_JSON`
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

/// KV store connection configuration (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct KvConfig {
    /// `KV_URL` — for the bundled sqlite-backed store, a filesystem path;
    /// the contract itself (§4.1) is storage-agnostic.
    pub url: String,
    /// `KV_PREFIX`
    #[serde(default = "defaults::default_kv_prefix")]
    pub prefix: String,
}

impl KvConfig {
    /// Build a `KvConfig` from just the connection URL, defaulting the prefix.
    pub fn new(url: String) -> Self {
        Self {
            url,
            prefix: defaults::default_kv_prefix(),
        }
    }
}

/// Fixed-window rate limiter configuration (§5, applies to the metadata endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct RateLimitConfig {
    #[serde(default = "defaults::default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "defaults::default_max_requests_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: defaults::default_max_requests(),
            window_ms: defaults::default_max_requests_window_ms(),
        }
    }
}

/// Branding/templating-only options (outside the specified core, §4.5's
/// confirm-login prompt still needs *some* copy to render).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct BrandingConfig {
    pub title: Option<String>,
    pub logo_url: Option<String>,
}
