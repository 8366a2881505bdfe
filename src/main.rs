//! Authorizing reverse proxy entry point.
//!
//! Parses CLI/env configuration, builds every collaborator (KV store, IdP
//! client, PKCE store, interaction manager, token signer, rate limiter,
//! supervised upstream process), assembles the HTTP router, and serves it
//! over TLS or plain HTTP depending on configuration.
//!
//! # Application lifecycle
//! 1. **Unknown** -> parse CLI args, init tracing
//! 2. **Initializing** -> load and validate configuration
//! 3. **StartingNetwork** -> build collaborators, bind listener
//! 4. **Ready** -> serving traffic
//! 5. **Terminating** -> graceful shutdown on ctrl_c

use authproxy::config::components::IdpConfig;
use authproxy::config::{AuthProxyConfig, ConfigError};
use authproxy::errors::StartupError;
use authproxy::idp::IdpClient;
use authproxy::interaction::InteractionManager;
use authproxy::kv::sqlite::SqliteKvStore;
use authproxy::kv::DynKvStore;
use authproxy::pkce::PkceStore;
use authproxy::ratelimit::RateLimiter;
use authproxy::signing::{self, DynSigner};
use authproxy::state::{ApplicationState, AppState, SharedState};
use authproxy::upstream_process::UpstreamProcessSupervisor;
use authproxy::{authserver, health, proxy, session_reset};

use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Router, body::Body};
use clap::Parser;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, fmt};

/// Layer that filters out a specific noisy error line emitted by the hyper
/// connection loop when a client disconnects mid-request.
struct FilteringLayer<L> {
    inner: L,
}

impl<L, S> Layer<S> for FilteringLayer<L>
where
    L: Layer<S>,
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        if event.metadata().level() == &tracing::Level::ERROR
            && visitor.message.contains("Error reading from stream")
        {
            return;
        }
        self.inner.on_event(event, ctx);
    }

    fn enabled(
        &self,
        metadata: &tracing::Metadata<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) -> bool {
        self.inner.enabled(metadata, ctx)
    }

    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.inner.on_new_span(attrs, id, ctx);
    }

    fn on_record(
        &self,
        span: &tracing::Id,
        values: &tracing::span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        self.inner.on_record(span, values, ctx);
    }

    fn on_enter(&self, id: &tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_enter(id, ctx);
    }

    fn on_exit(&self, id: &tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_exit(id, ctx);
    }

    fn on_close(&self, id: tracing::Id, ctx: tracing_subscriber::layer::Context<'_, S>) {
        self.inner.on_close(id, ctx);
    }
}

struct MessageVisitor {
    message: String,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

/// CLI arguments. Every field name mirrors the environment variable named in
/// spec §6 EXTERNAL INTERFACES; `clap`'s `env` attribute binds both in one
/// place. A field left unset here falls back to whatever `--config-file`
/// (or the compiled-in default path) supplies.
#[derive(Parser, Debug, Clone)]
#[command(name = "authproxy", version, about = "Authorizing reverse proxy", long_about = None)]
struct Args {
    /// Config file path (overrides default path and AUTHPROXY_CONFIG_PATH)
    #[arg(long = "config-file", value_name = "FILE", env = "AUTHPROXY_CONFIG_PATH")]
    config_file: Option<PathBuf>,

    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    #[arg(long, env = "BIND_ADDRESS")]
    bind_address: Option<String>,
    #[arg(long, env = "UPSTREAM_SERVER_URL")]
    upstream_server_url: Option<String>,
    #[arg(long, env = "UPSTREAM_SERVER_RUN_COMMAND")]
    upstream_server_run_command: Option<String>,
    #[arg(long, env = "UPSTREAM_SERVER_RUN_DIR")]
    upstream_server_run_dir: Option<String>,

    #[arg(long, env = "IDP_SERVER_URL")]
    idp_server_url: Option<String>,
    #[arg(long, env = "IDP_CLIENT_ID")]
    idp_client_id: Option<String>,
    #[arg(long, env = "IDP_CLIENT_SECRET")]
    idp_client_secret: Option<String>,
    #[arg(long, env = "IDP_SCOPE")]
    idp_scope: Option<String>,
    #[arg(long, env = "IDP_SERVER_METADATA_FILE")]
    idp_server_metadata_file: Option<String>,
    #[arg(long, env = "IDP_CALLBACK_PATH")]
    idp_callback_path: Option<String>,

    #[arg(long, env = "PROXY_SCOPE")]
    proxy_scope: Option<String>,
    #[arg(long, env = "OIDC_PROVIDER_JWKS")]
    oidc_provider_jwks: Option<String>,

    #[arg(long, env = "KV_URL")]
    kv_url: Option<String>,
    #[arg(long, env = "KV_PREFIX")]
    kv_prefix: Option<String>,

    #[arg(long, env = "RATE_LIMIT_MAX_REQUESTS")]
    rate_limit_max_requests: Option<u32>,
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS")]
    rate_limit_window_ms: Option<u64>,

    #[arg(long, env = "LOCAL_INSECURE")]
    local_insecure: Option<bool>,
    #[arg(long, env = "DEPLOYMENT_ENV")]
    deployment_env: Option<String>,

    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<String>,
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<String>,

    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS")]
    upstream_timeout_secs: Option<u64>,

    #[arg(long, env = "BRANDING_TITLE")]
    branding_title: Option<String>,
    #[arg(long, env = "BRANDING_LOGO_URL")]
    branding_logo_url: Option<String>,
}

/// Resolve the effective configuration: load `--config-file` (or the
/// compiled-in default path) if present, otherwise build one purely from
/// CLI/env, then apply any CLI/env value the caller explicitly set on top.
fn resolve_config(args: &Args) -> Result<AuthProxyConfig, StartupError> {
    let loaded = AuthProxyConfig::load(args.config_file.clone());

    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigError::Missing(_)) if args.config_file.is_none() => {
            build_config_from_args(args)?
        }
        Err(e) => return Err(StartupError::ConfigError(e.to_string())),
    };

    apply_overrides(&mut config, args);

    config
        .validate()
        .map_err(|e| StartupError::ConfigError(e.to_string()))?;

    Ok(config)
}

fn build_config_from_args(args: &Args) -> Result<AuthProxyConfig, StartupError> {
    let base_url = args
        .base_url
        .clone()
        .ok_or_else(|| StartupError::ConfigError("BASE_URL must be set".to_string()))?;
    let upstream_server_url = args
        .upstream_server_url
        .clone()
        .ok_or_else(|| StartupError::ConfigError("UPSTREAM_SERVER_URL must be set".to_string()))?;
    let idp_server_url = args
        .idp_server_url
        .clone()
        .ok_or_else(|| StartupError::ConfigError("IDP_SERVER_URL must be set".to_string()))?;
    let idp_client_id = args
        .idp_client_id
        .clone()
        .ok_or_else(|| StartupError::ConfigError("IDP_CLIENT_ID must be set".to_string()))?;
    let idp_client_secret = args
        .idp_client_secret
        .clone()
        .ok_or_else(|| StartupError::ConfigError("IDP_CLIENT_SECRET must be set".to_string()))?;
    let kv_url = args
        .kv_url
        .clone()
        .ok_or_else(|| StartupError::ConfigError("KV_URL must be set".to_string()))?;

    let idp = IdpConfig::new(idp_server_url, idp_client_id, idp_client_secret);
    let kv = authproxy::config::components::KvConfig::new(kv_url);

    Ok(AuthProxyConfig::from_required(
        base_url,
        upstream_server_url,
        idp,
        kv,
    ))
}

fn apply_overrides(config: &mut AuthProxyConfig, args: &Args) {
    if let Some(v) = &args.base_url {
        config.base_url = v.clone();
    }
    if let Some(v) = args.port {
        config.port = v;
    }
    if let Some(v) = &args.bind_address {
        config.bind_address = v.clone();
    }
    if let Some(v) = &args.upstream_server_url {
        config.upstream_server_url = v.clone();
    }
    if let Some(v) = &args.upstream_server_run_command {
        config.upstream_process.run_command = Some(v.clone());
    }
    if let Some(v) = &args.upstream_server_run_dir {
        config.upstream_process.dir = Some(v.clone());
    }
    if let Some(v) = &args.idp_server_url {
        config.idp.server_url = v.clone();
    }
    if let Some(v) = &args.idp_client_id {
        config.idp.client_id = v.clone();
    }
    if let Some(v) = &args.idp_client_secret {
        config.idp.client_secret = v.clone();
    }
    if let Some(v) = &args.idp_scope {
        config.idp.scope = v.clone();
    }
    if let Some(v) = &args.idp_server_metadata_file {
        config.idp.metadata_file = Some(v.clone());
    }
    if let Some(v) = &args.idp_callback_path {
        config.idp.callback_path = v.clone();
    }
    if let Some(v) = &args.proxy_scope {
        config.proxy_scope = v.clone();
    }
    if let Some(v) = &args.oidc_provider_jwks {
        config.oidc_provider_jwks = Some(v.clone());
    }
    if let Some(v) = &args.kv_url {
        config.kv.url = v.clone();
    }
    if let Some(v) = &args.kv_prefix {
        config.kv.prefix = v.clone();
    }
    if let Some(v) = args.rate_limit_max_requests {
        config.rate_limit.max_requests = v;
    }
    if let Some(v) = args.rate_limit_window_ms {
        config.rate_limit.window_ms = v;
    }
    if let Some(v) = args.local_insecure {
        config.local_insecure = v;
    }
    if let Some(v) = &args.deployment_env {
        config.deployment_env = v.clone();
    }
    if args.tls_key.is_some() || args.tls_cert.is_some() {
        let mut tls = config.tls.clone().unwrap_or_default();
        if let Some(v) = &args.tls_key {
            tls.key = Some(v.clone());
        }
        if let Some(v) = &args.tls_cert {
            tls.cert = Some(v.clone());
        }
        config.tls = Some(tls);
    }
    if let Some(v) = args.upstream_timeout_secs {
        config.upstream_timeout_secs = v;
    }
    if let Some(v) = &args.branding_title {
        config.branding.title = Some(v.clone());
    }
    if let Some(v) = &args.branding_logo_url {
        config.branding.logo_url = Some(v.clone());
    }
}

/// Construct the full HTTP router: the authorization server's own paths,
/// session reset, health probes, metrics, and a reverse-proxy catch-all for
/// everything else (C7). The metadata endpoint is the only one rate-limited
/// (§5); everything else relies on downstream/upstream token checks instead.
fn build_router(state: &SharedState) -> Router<SharedState> {
    Router::new()
        .merge(authserver::router(state.rate_limiter.clone()))
        .merge(session_reset::router())
        .route("/livez", get(health::livez))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy::handle)
}

/// Bridges the metrics module's raw `hyper` response into an axum response,
/// the way the teacher's own management router mounted `/metrics`.
async fn metrics_handler() -> Response {
    use http_body_util::BodyExt;

    let hyper_response = authproxy::metrics::handler::make_metrics_response();
    let (parts, body) = hyper_response.into_parts();
    let body_bytes = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    Response::builder()
        .status(parts.status)
        .header(
            "content-type",
            parts
                .headers
                .get("content-type")
                .cloned()
                .unwrap_or_else(|| "text/plain".parse().unwrap()),
        )
        .body(Body::from(body_bytes))
        .unwrap()
}

struct TlsMaterial {
    certs: Vec<u8>,
    key: Vec<u8>,
}

async fn get_tls_key_material(config: &AuthProxyConfig) -> anyhow::Result<Option<TlsMaterial>> {
    let Some(tls) = &config.tls else {
        return Ok(None);
    };
    let (Some(key_path), Some(cert_path)) = (&tls.key, &tls.cert) else {
        return Ok(None);
    };
    if key_path.is_empty() || cert_path.is_empty() {
        return Ok(None);
    }

    let cert_bytes = tokio::fs::read(cert_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read TLS cert {}: {}", cert_path, e))?;
    let key_bytes = tokio::fs::read(key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read TLS key {}: {}", key_path, e))?;

    if cert_bytes.is_empty() || key_bytes.is_empty() {
        anyhow::bail!("TLS key or cert file is empty");
    }

    Ok(Some(TlsMaterial {
        certs: cert_bytes,
        key: key_bytes,
    }))
}

fn build_tls_acceptor(material: &TlsMaterial) -> anyhow::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut material.certs.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse TLS certificate chain: {}", e))?;
    let key = rustls_pemfile::private_key(&mut material.key.as_slice())
        .map_err(|e| anyhow::anyhow!("failed to parse TLS private key: {}", e))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in TLS_KEY file"))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("invalid TLS certificate/key pair: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

async fn resolve_bind_addr(bind_address: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let candidate = format!("{}:{}", bind_address, port);
    tokio::net::lookup_host(&candidate)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve bind address {}", candidate))
}

async fn run_server(
    app: Router,
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    state: SharedState,
) -> anyhow::Result<()> {
    let app = app.layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if let Some(acceptor) = tls_acceptor {
        state.set_state(ApplicationState::Ready);
        tracing::info!("listening on https://{}", addr);

        loop {
            let (stream, peer_addr) = tokio::select! {
                result = listener.accept() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    return Ok(());
                }
            };
            let acceptor = acceptor.clone();
            // ConnectInfo is normally injected by axum's connect-info make
            // service; the manual hyper accept loop needs it added by hand
            // so `ratelimit::enforce`'s `ConnectInfo` extractor still works.
            let app = app
                .clone()
                .layer(axum::Extension(axum::extract::ConnectInfo(peer_addr)));

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "TLS accept failed");
                        return;
                    }
                };
                let service = TowerToHyperService::new(app);
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await;
            });
        }
    } else {
        state.set_state(ApplicationState::Ready);
        tracing::info!("listening on http://{}", addr);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
        Ok(())
    }
}

/// Request logging middleware (debug level) mirroring the teacher's
/// `log_requests`, minus the request/response body tracing this proxy has no
/// use for (bodies here are opaque OAuth payloads or proxied traffic).
async fn log_requests(req: Request<Body>, next: Next) -> Response {
    tracing::debug!(method = %req.method(), uri = %req.uri(), "received request");
    let response = next.run(req).await;
    tracing::debug!(status = %response.status(), "sending response");
    response
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let fmt_layer = fmt::layer().with_target(false).compact();
    let filtering_layer = FilteringLayer { inner: fmt_layer };
    tracing_subscriber::registry()
        .with(filtering_layer)
        .with(tracing_subscriber::filter::EnvFilter::new(env_filter))
        .init();

    let config = resolve_config(&args)?;
    tracing::info!(base_url = %config.base_url, "configuration loaded");

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install aws-lc-rs crypto provider"))?;

    authproxy::metrics::init();

    let sqlite_store = Arc::new(SqliteKvStore::open(std::path::Path::new(&config.kv.url))?);
    let kv: DynKvStore = sqlite_store.clone();
    spawn_kv_sweeper(sqlite_store);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream_timeout_secs))
        .build()?;

    let idp = Arc::new(
        IdpClient::discover(config.idp.clone(), http.clone())
            .await
            .map_err(|e| StartupError::Other(format!("upstream IdP discovery failed: {}", e)))?,
    );

    let pkce = Arc::new(PkceStore::new(kv.clone(), config.is_production()));
    let interactions = Arc::new(InteractionManager::new(
        kv.clone(),
        idp.clone(),
        pkce.clone(),
        config.base_url.clone(),
    ));

    let jwks = config.oidc_provider_jwks.clone().ok_or_else(|| {
        StartupError::SigningMisconfigured("OIDC_PROVIDER_JWKS must be set".to_string())
    })?;
    let signer: DynSigner = signing::load_signer_from_json(&jwks)
        .map_err(|e| StartupError::SigningMisconfigured(e.to_string()))?;

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests,
        Duration::from_millis(config.rate_limit.window_ms),
    ));

    let upstream_process = UpstreamProcessSupervisor::spawn(&config.upstream_process)?.map(Arc::new);
    if let Some(supervisor) = &upstream_process {
        supervisor.clone().watch();
    }

    let bind_address = config.bind_address.clone();
    let port = config.port;
    let tls_material = get_tls_key_material(&config).await?;

    let state: SharedState = Arc::new(AppState::new(
        config,
        kv,
        idp,
        pkce,
        interactions,
        signer,
        http,
        rate_limiter,
        upstream_process,
    ));
    state.set_state(ApplicationState::Initializing);

    let tls_acceptor = tls_material.as_ref().map(build_tls_acceptor).transpose()?;

    let app = build_router(&state)
        .layer(middleware::from_fn(log_requests))
        .with_state(state.clone());

    let addr = resolve_bind_addr(&bind_address, port).await?;

    let result = run_server(app, addr, tls_acceptor, state.clone()).await;

    state.set_state(ApplicationState::Terminating);
    if let Some(supervisor) = state.upstream_process.clone() {
        supervisor.shutdown().await;
    }

    result
}

/// Periodically sweeps expired KV records so an idle deployment doesn't
/// accumulate stale authorization codes, PKCE entries, or sessions forever.
fn spawn_kv_sweeper(kv: Arc<SqliteKvStore>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            match kv.sweep_expired().await {
                Ok(count) if count > 0 => {
                    tracing::debug!(count, "swept expired kv records");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "kv sweep failed"),
            }
        }
    });
}
