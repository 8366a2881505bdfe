/// Authproxy configuration defaults module.
///
/// Provides default value helpers for serde deserialization in config
/// structs. These keep `components.rs` and `mod.rs` consistent when a
/// config block is missing entirely from the configuration file.
pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_false() -> bool {
    false
}

pub(crate) fn default_port() -> u16 {
    8080
}

pub(crate) fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_idp_scope() -> String {
    "openid profile email".to_string()
}

pub(crate) fn default_proxy_scope() -> String {
    "openid offline_access".to_string()
}

pub(crate) fn default_idp_callback_path() -> String {
    "/interaction/identity/callback".to_string()
}

pub(crate) fn default_idp_unique_callback_path() -> String {
    "/interaction/:uid/identity/callback".to_string()
}

pub(crate) fn default_kv_prefix() -> String {
    "oidc:".to_string()
}

pub(crate) fn default_max_requests() -> u32 {
    60
}

pub(crate) fn default_max_requests_window_ms() -> u64 {
    60_000
}

pub(crate) fn default_deployment_env() -> String {
    "development".to_string()
}

pub(crate) fn default_upstream_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_cors() -> Option<String> {
    None
}
