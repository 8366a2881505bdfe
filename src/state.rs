//! Shared application state wiring every component together (cross-cutting).

use crate::config::AuthProxyConfig;
use crate::idp::IdpClient;
use crate::interaction::InteractionManager;
use crate::kv::DynKvStore;
use crate::pkce::PkceStore;
use crate::ratelimit::RateLimiter;
use crate::signing::DynSigner;
use crate::upstream_process::UpstreamProcessSupervisor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Application lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Unknown = 0,
    Initializing = 1,
    StartingNetwork = 2,
    Ready = 3,
    Terminating = 4,
}

pub struct AppState {
    pub config: AuthProxyConfig,
    pub kv: DynKvStore,
    pub idp: Arc<IdpClient>,
    pub pkce: Arc<PkceStore>,
    pub interactions: Arc<InteractionManager>,
    pub signer: DynSigner,
    pub http: reqwest::Client,
    pub rate_limiter: Arc<RateLimiter>,
    pub upstream_process: Option<Arc<UpstreamProcessSupervisor>>,
    lifecycle: AtomicU8,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AuthProxyConfig,
        kv: DynKvStore,
        idp: Arc<IdpClient>,
        pkce: Arc<PkceStore>,
        interactions: Arc<InteractionManager>,
        signer: DynSigner,
        http: reqwest::Client,
        rate_limiter: Arc<RateLimiter>,
        upstream_process: Option<Arc<UpstreamProcessSupervisor>>,
    ) -> Self {
        Self {
            config,
            kv,
            idp,
            pkce,
            interactions,
            signer,
            http,
            rate_limiter,
            upstream_process,
            lifecycle: AtomicU8::new(ApplicationState::Unknown as u8),
        }
    }

    pub fn set_state(&self, value: ApplicationState) {
        debug!("application state changed to {:?}", value);
        self.lifecycle.store(value as u8, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let state = self.lifecycle.load(Ordering::SeqCst);
        state >= ApplicationState::Initializing as u8 && state < ApplicationState::Terminating as u8
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) >= ApplicationState::Ready as u8
    }

    /// The signer is constructed eagerly at startup (§6), so once the
    /// process is alive it is always ready; kept as a named check so the
    /// health handler's shape matches the rest of the readiness surface.
    pub fn is_signer_ready(&self) -> bool {
        true
    }
}

pub type SharedState = Arc<AppState>;
