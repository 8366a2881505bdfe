//! Authorization server endpoints (C6): the proxy is itself a full OAuth
//! 2.1/OIDC authorization server to its downstream clients, terminating
//! their auth the same way it brokers the upstream IdP's.

use crate::errors::ProxyError;
use crate::interaction::{Interaction, random_id};
use crate::kv::{Kind, Record};
use crate::ratelimit::RateLimiter;
use crate::state::SharedState;
use axum::extract::{Form, OriginalUri, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const DOWNSTREAM_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(3600);
const DOWNSTREAM_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// The metadata endpoint carries its own rate limit (§5); everything else
/// here relies on token/client-secret checks instead.
pub fn router(rate_limiter: Arc<RateLimiter>) -> Router<SharedState> {
    let metadata_route = Router::new()
        .route("/.well-known/oauth-authorization-server", get(metadata))
        .route_layer(middleware::from_fn_with_state(
            rate_limiter,
            crate::ratelimit::enforce,
        ));

    Router::new()
        .merge(metadata_route)
        .route("/jwks", get(jwks))
        .route("/reg", post(register_client))
        .route("/auth", get(authorize))
        .route("/interaction/{uid}", get(confirm_page).post(confirm_submit))
        .route(
            "/interaction/identity/callback",
            get(generic_upstream_callback),
        )
        .route(
            "/interaction/{uid}/identity/callback",
            get(upstream_callback),
        )
        .route("/token", post(token))
        .route("/token/introspection", post(introspection))
        .route("/token/revocation", post(revocation))
        .route("/me", get(me))
        .route("/session/end", post(session_end))
}

async fn metadata(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let base = state.config.base_url.trim_end_matches('/');
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{}/auth", base),
        "token_endpoint": format!("{}/token", base),
        "registration_endpoint": format!("{}/reg", base),
        "introspection_endpoint": format!("{}/token/introspection", base),
        "revocation_endpoint": format!("{}/token/revocation", base),
        "jwks_uri": format!("{}/jwks", base),
        "userinfo_endpoint": format!("{}/me", base),
        "scopes_supported": state.config.proxy_scope.split(' ').collect::<Vec<_>>(),
        "response_types_supported": ["code", "code token"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "token_endpoint_auth_methods_supported": ["client_secret_post"],
        "code_challenge_methods_supported": ["S256"],
    }))
}

async fn jwks(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(state.signer.jwks())
}

#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DownstreamClient {
    client_id: String,
    client_secret: String,
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: Option<String>,
}

/// Dynamic client registration (RFC 7591); downstream clients are always
/// confidential (a `client_secret` is issued) since this proxy only serves
/// server-side downstream consumers.
async fn register_client(
    State(state): State<SharedState>,
    Json(req): Json<RegistrationRequest>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    if req.redirect_uris.is_empty() {
        return Err(ProxyError::ConfigurationError(
            "redirect_uris must not be empty".to_string(),
        ));
    }
    let client_id = random_id(16);
    let client_secret = random_id(32);
    let client = DownstreamClient {
        client_id: client_id.clone(),
        client_secret: client_secret.clone(),
        redirect_uris: req.redirect_uris,
        client_name: req.client_name,
    };
    let payload = serde_json::to_value(&client)
        .map_err(|e| ProxyError::ConfigurationError(e.to_string()))?;
    state
        .kv
        .upsert(Record::new(Kind::DownstreamClient, &client_id, payload), None)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

    Ok(Json(json!({
        "client_id": client.client_id,
        "client_secret": client.client_secret,
        "redirect_uris": client.redirect_uris,
        "client_name": client.client_name,
        "token_endpoint_auth_method": "client_secret_post",
    })))
}

async fn load_client(state: &SharedState, client_id: &str) -> Result<DownstreamClient, ProxyError> {
    let record = state
        .kv
        .find(Kind::DownstreamClient, client_id)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::ConfigurationError("unknown client_id".to_string()))?;
    serde_json::from_value(record.payload)
        .map_err(|_| ProxyError::ConfigurationError("corrupt client record".to_string()))
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    code_challenge: String,
    code_challenge_method: String,
}

/// `/auth`: validates the downstream request and starts an interaction
/// (C5), redirecting the user agent to the confirm-login page.
async fn authorize(
    State(state): State<SharedState>,
    Query(q): Query<AuthorizeQuery>,
) -> Result<Response, ProxyError> {
    if q.response_type != "code" {
        return Err(ProxyError::ConfigurationError(
            "unsupported response_type".to_string(),
        ));
    }
    if q.code_challenge_method != "S256" {
        return Err(ProxyError::ConfigurationError(
            "code_challenge_method must be S256".to_string(),
        ));
    }
    let client = load_client(&state, &q.client_id).await?;
    if !client.redirect_uris.iter().any(|u| u == &q.redirect_uri) {
        return Err(ProxyError::ConfigurationError(
            "redirect_uri not registered for this client".to_string(),
        ));
    }

    let uid = random_id(16);
    let interaction = Interaction {
        uid: uid.clone(),
        downstream_client_id: q.client_id,
        downstream_redirect_uri: q.redirect_uri,
        downstream_state: q.state,
        downstream_scope: q.scope.unwrap_or_else(|| state.config.proxy_scope.clone()),
        downstream_code_challenge: q.code_challenge,
        downstream_code_challenge_method: q.code_challenge_method,
        login_confirmed: false,
    };
    state.interactions.start(interaction).await?;

    Ok(Redirect::to(&format!("/interaction/{}", uid)).into_response())
}

/// `/interaction/:uid` GET (§4.3 START → confirm-login/login): once the
/// browser has already confirmed login for this downstream client, skip
/// straight past the prompt to the upstream redirect; otherwise render the
/// confirm-login page. Production deployments are expected to replace this
/// page with branded templates; the handler only needs to produce a form
/// that POSTs back to the same path.
async fn confirm_page(
    State(state): State<SharedState>,
    Path(uid): Path<String>,
) -> Result<Response, ProxyError> {
    let interaction = state.interactions.find(&uid).await?;
    if interaction.login_confirmed {
        let url = state.interactions.build_upstream_redirect(&uid).await?;
        return Ok(Redirect::to(url.as_str()).into_response());
    }

    let title = state
        .config
        .branding
        .title
        .clone()
        .unwrap_or_else(|| "Sign in".to_string());
    Ok(Html(format!(
        "<!doctype html><html><head><title>{title}</title></head><body>\
         <h1>{title}</h1>\
         <p>{client} is requesting access.</p>\
         <form method=\"post\">\
         <button type=\"submit\" name=\"confirmed\" value=\"true\">Continue</button>\
         <button type=\"submit\" name=\"confirmed\" value=\"false\">Cancel</button>\
         </form></body></html>",
        title = title,
        client = interaction.downstream_client_id,
    ))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct ConfirmSubmitRequest {
    #[serde(default)]
    confirmed: Option<String>,
}

/// `/interaction/:uid` POST (§4.3 confirm-login → login / abort):
/// `confirmed=true` records the confirmation on the interaction and
/// finishes with no result, re-entering `GET /interaction/:uid` which now
/// proceeds to the upstream redirect; any other value aborts the
/// interaction and sends the browser to session reset.
async fn confirm_submit(
    State(state): State<SharedState>,
    Path(uid): Path<String>,
    Form(req): Form<ConfirmSubmitRequest>,
) -> Result<Redirect, ProxyError> {
    if req.confirmed.as_deref() == Some("true") {
        state.interactions.confirm_login(&uid).await?;
        return Ok(Redirect::to(&format!("/interaction/{}", uid)));
    }
    Ok(Redirect::to("/session/reset"))
}

#[derive(Debug, Deserialize)]
struct UpstreamCallbackQuery {
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

/// `/interaction/identity/callback` (§4.3/§6 `IDP_CALLBACK_PATH`): some
/// upstream IdPs only support a single, statically-registered redirect URI
/// rather than one per interaction. This resolves the interaction from the
/// `state` the IdP echoes back and forwards to the uid-specific callback
/// path, preserving the rest of the query string.
async fn generic_upstream_callback(
    State(state): State<SharedState>,
    Query(q): Query<UpstreamCallbackQuery>,
    OriginalUri(uri): OriginalUri,
) -> Result<Redirect, ProxyError> {
    let oauth_state = q.state.ok_or(ProxyError::ConfigurationError(
        "missing state".to_string(),
    ))?;
    let interaction = state.interactions.find_by_state(&oauth_state).await?;
    let query = uri.query().unwrap_or_default();
    Ok(Redirect::to(&format!(
        "/interaction/{}/identity/callback?{}",
        interaction.uid, query
    )))
}

/// `/interaction/:uid/identity/callback`: the upstream IdP redirects here
/// after its own login. Completes the grant and bounces the user agent
/// back to the downstream client's `redirect_uri`.
async fn upstream_callback(
    State(state): State<SharedState>,
    Path(uid): Path<String>,
    Query(q): Query<UpstreamCallbackQuery>,
) -> Result<Redirect, ProxyError> {
    if let Some(err) = q.error {
        return Err(ProxyError::ConfigurationError(format!(
            "upstream identity provider returned an error: {}",
            err
        )));
    }
    let code = q.code.ok_or(ProxyError::ConfigurationError(
        "missing upstream authorization code".to_string(),
    ))?;
    let oauth_state = q.state.unwrap_or_else(|| uid.clone());

    let (interaction, downstream_code) = state
        .interactions
        .complete_upstream_callback(&uid, &oauth_state, &code)
        .await?;

    let mut redirect = format!(
        "{}?code={}",
        interaction.downstream_redirect_uri, downstream_code
    );
    if let Some(downstream_state) = interaction.downstream_state {
        redirect.push_str("&state=");
        redirect.push_str(&downstream_state);
    }
    Ok(Redirect::to(&redirect))
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponseBody {
    access_token: String,
    token_type: &'static str,
    expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    scope: String,
}

fn verify_pkce(verifier: &str, challenge: &str, method: &str) -> bool {
    match method {
        "S256" => {
            let mut hasher = Sha256::new();
            hasher.update(verifier.as_bytes());
            B64.encode(hasher.finalize()) == challenge
        }
        "plain" => verifier == challenge,
        _ => false,
    }
}

async fn authenticate_client(
    state: &SharedState,
    client_id: &str,
    client_secret: Option<&str>,
) -> Result<DownstreamClient, ProxyError> {
    let client = load_client(state, client_id).await?;
    if client.client_secret != client_secret.unwrap_or_default() {
        return Err(ProxyError::AccessDenied);
    }
    Ok(client)
}

/// `/token`: redeems a downstream authorization code, or rotates a
/// downstream refresh token, minting the opaque access/refresh tokens this
/// authorization server issues to its own clients.
async fn token(
    State(state): State<SharedState>,
    Form(req): Form<TokenRequest>,
) -> Result<Json<TokenResponseBody>, ProxyError> {
    match req.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, req).await,
        "refresh_token" => refresh_token_grant(&state, req).await,
        _ => Err(ProxyError::ConfigurationError(
            "unsupported grant_type".to_string(),
        )),
    }
    .map(Json)
}

async fn authorization_code_grant(
    state: &SharedState,
    req: TokenRequest,
) -> Result<TokenResponseBody, ProxyError> {
    let code = req
        .code
        .ok_or(ProxyError::ConfigurationError("missing code".to_string()))?;
    let redirect_uri = req.redirect_uri.ok_or(ProxyError::ConfigurationError(
        "missing redirect_uri".to_string(),
    ))?;
    let code_verifier = req.code_verifier.ok_or(ProxyError::ConfigurationError(
        "missing code_verifier".to_string(),
    ))?;

    authenticate_client(state, &req.client_id, req.client_secret.as_deref()).await?;

    let record = state
        .kv
        .consume(Kind::AuthorizationCode, &code)
        .await
        .map_err(|_| ProxyError::ConfigurationError("invalid or already used code".to_string()))?;
    let auth_code: crate::interaction::DownstreamAuthCode =
        serde_json::from_value(record.payload)
            .map_err(|_| ProxyError::ConfigurationError("corrupt authorization code".to_string()))?;

    if auth_code.downstream_client_id != req.client_id || auth_code.downstream_redirect_uri != redirect_uri
    {
        return Err(ProxyError::ConfigurationError(
            "client_id/redirect_uri mismatch".to_string(),
        ));
    }
    if !verify_pkce(
        &code_verifier,
        &auth_code.downstream_code_challenge,
        &auth_code.downstream_code_challenge_method,
    ) {
        return Err(ProxyError::AccessDenied);
    }

    let grant = crate::grant::load_grant(&state.kv, &auth_code.grant_id).await?;
    mint_tokens(state, &auth_code.grant_id, &grant.scope).await
}

async fn refresh_token_grant(
    state: &SharedState,
    req: TokenRequest,
) -> Result<TokenResponseBody, ProxyError> {
    let refresh_token = req.refresh_token.ok_or(ProxyError::ConfigurationError(
        "missing refresh_token".to_string(),
    ))?;
    authenticate_client(state, &req.client_id, req.client_secret.as_deref()).await?;

    let record = state
        .kv
        .find(Kind::RefreshToken, &refresh_token)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::InvalidAccessToken)?;
    let grant_id = record.grant_id.ok_or(ProxyError::InvalidAccessToken)?;
    state
        .kv
        .destroy(Kind::RefreshToken, &refresh_token)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

    let grant = crate::grant::load_grant(&state.kv, &grant_id).await?;
    mint_tokens(state, &grant_id, &grant.scope).await
}

async fn mint_tokens(
    state: &SharedState,
    grant_id: &str,
    scope: &str,
) -> Result<TokenResponseBody, ProxyError> {
    let access_token = random_id(32);
    let refresh_token = random_id(32);

    state
        .kv
        .upsert(
            Record::new(Kind::AccessToken, &access_token, json!({})).with_grant_id(grant_id),
            Some(DOWNSTREAM_ACCESS_TOKEN_TTL),
        )
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;
    state
        .kv
        .upsert(
            Record::new(Kind::RefreshToken, &refresh_token, json!({})).with_grant_id(grant_id),
            Some(DOWNSTREAM_REFRESH_TOKEN_TTL),
        )
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?;

    Ok(TokenResponseBody {
        access_token,
        token_type: "Bearer",
        expires_in: DOWNSTREAM_ACCESS_TOKEN_TTL.as_secs(),
        refresh_token: Some(refresh_token),
        scope: scope.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct IntrospectRequest {
    token: String,
}

/// `/token/introspection` (RFC 7662). Checks both token kinds since the
/// caller doesn't have to tell us which one it's holding.
async fn introspection(
    State(state): State<SharedState>,
    Form(req): Form<IntrospectRequest>,
) -> Json<serde_json::Value> {
    for kind in [Kind::AccessToken, Kind::RefreshToken] {
        if let Ok(Some(record)) = state.kv.find(kind, &req.token).await {
            let grant_id = record.grant_id.unwrap_or_default();
            if let Ok(grant) = crate::grant::load_grant(&state.kv, &grant_id).await {
                return Json(json!({
                    "active": true,
                    "scope": grant.scope,
                    "client_id": grant.downstream_client_id,
                    "token_type": "Bearer",
                }));
            }
        }
    }
    Json(json!({ "active": false }))
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: String,
}

/// `/token/revocation` (RFC 7009). Always returns 200 per spec, whether or
/// not the token was found.
async fn revocation(
    State(state): State<SharedState>,
    Form(req): Form<RevokeRequest>,
) -> StatusCode {
    let _ = state.kv.destroy(Kind::AccessToken, &req.token).await;
    let _ = state.kv.destroy(Kind::RefreshToken, &req.token).await;
    StatusCode::OK
}

/// `/me`: the OIDC userinfo-equivalent, returning the upstream IdP's claims
/// captured for this grant at the last (re)authorization.
async fn me(
    State(state): State<SharedState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let token = bearer_token(&headers)?;
    let record = state
        .kv
        .find(Kind::AccessToken, &token)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::InvalidAccessToken)?;
    let grant_id = record.grant_id.ok_or(ProxyError::InvalidAccessToken)?;
    let grant = crate::grant::load_grant(&state.kv, &grant_id).await?;
    Ok(Json(grant.upstream_user_data))
}

#[derive(Debug, Deserialize)]
struct SessionEndRequest {
    token: String,
}

/// `/session/end`: revokes the whole grant (every downstream and upstream
/// credential tied to it), not just the presented token.
async fn session_end(
    State(state): State<SharedState>,
    Form(req): Form<SessionEndRequest>,
) -> Result<StatusCode, ProxyError> {
    for kind in [Kind::AccessToken, Kind::RefreshToken] {
        if let Ok(Some(record)) = state.kv.find(kind, &req.token).await
            && let Some(grant_id) = record.grant_id
        {
            let _ = state.kv.revoke_by_grant(&grant_id).await;
            return Ok(StatusCode::OK);
        }
    }
    Ok(StatusCode::OK)
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Result<String, ProxyError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(ProxyError::MissingAuthorization)?;
    let value = value.to_str().map_err(|_| ProxyError::MalformedAuthorization)?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(ProxyError::MalformedAuthorization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_s256_pkce() {
        let verifier = "abcdefghij0123456789";
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = B64.encode(hasher.finalize());
        assert!(verify_pkce(verifier, &challenge, "S256"));
        assert!(!verify_pkce("wrong", &challenge, "S256"));
    }

    #[test]
    fn rejects_unknown_challenge_method() {
        assert!(!verify_pkce("verifier", "challenge", "bogus"));
    }
}
