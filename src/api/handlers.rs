use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{authenticate, verify_client, Caller, TokenResponse};
use crate::errors::AppError;
use crate::mcp::commands::dispatch;
use crate::mcp::manifest::{
    if_none_match_matches, manifest_document, protected_resource_document, CachedDocument,
    DISCOVERY_TTL_SECS,
};
use crate::mcp::types::{CommandRequest, Envelope};
use crate::middleware::rate_limit::Bucket;
use crate::AppState;

/// Lifetime of tokens issued over HTTP when the client does not ask.
pub const DEFAULT_TOKEN_TTL_HOURS: u64 = 24;

// ── Commands ─────────────────────────────────────────────────

/// `POST /commands`: authenticate, rate-limit, dispatch, envelope.
pub async fn commands(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let parsed: Result<Value, serde_json::Error> = serde_json::from_slice(&body);
    let request_id = parsed.as_ref().ok().and_then(CommandRequest::request_id_of);
    let command_name = parsed
        .as_ref()
        .ok()
        .and_then(|v| v.get("command"))
        .and_then(Value::as_str)
        .map(String::from);
    let ip = client_ip(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.config.trust_forwarded_for,
    );

    let (response, status, error_code) = match run_command(&state, ip, &headers, parsed).await {
        Ok(data) => (
            Json(Envelope::success(data, request_id)).into_response(),
            StatusCode::OK.as_u16(),
            None,
        ),
        Err(e) => {
            let status = e.status().as_u16();
            let code = e.code();
            tracing::debug!(code = code, status = status, "command failed");
            (
                e.into_envelope_response(request_id, Some(&state.config.resource_metadata_url())),
                status,
                Some(code),
            )
        }
    };

    state.metrics.record_command(
        command_name.as_deref(),
        status,
        error_code,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn run_command(
    state: &AppState,
    ip: String,
    headers: &HeaderMap,
    body: Result<Value, serde_json::Error>,
) -> Result<Value, AppError> {
    let token = authenticate(&state.tokens, headers, state.config.require_auth).await?;
    let caller = Caller::new(ip, token);

    state
        .limiter
        .enforce(Bucket::Commands, &caller.identity(), caller.is_authenticated())
        .await?;

    let body = body.map_err(|e| AppError::InvalidPayload(format!("body is not valid JSON: {}", e)))?;
    let request = CommandRequest::from_value(body)?;
    dispatch(state, &caller, &request).await
}

/// Remote address of the caller. `X-Forwarded-For` is only honoured behind
/// a trusted proxy.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ── Discovery ────────────────────────────────────────────────

pub async fn mcp_manifest(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let doc = manifest_document(&state.cache, &state.config, state.engine.schema()).await;
    discovery_response(&headers, doc)
}

pub async fn protected_resource(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let doc = protected_resource_document(&state.cache, &state.config).await;
    discovery_response(&headers, doc)
}

fn discovery_response(headers: &HeaderMap, doc: CachedDocument) -> Response {
    let cache_control = format!("public, max-age={}", DISCOVERY_TTL_SECS);

    let not_modified = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| if_none_match_matches(v, &doc.etag))
        .unwrap_or(false);
    if not_modified {
        return (
            StatusCode::NOT_MODIFIED,
            [(ETAG, doc.etag), (CACHE_CONTROL, cache_control)],
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (ETAG, doc.etag),
            (CACHE_CONTROL, cache_control),
        ],
        doc.body,
    )
        .into_response()
}

// ── Token endpoint ───────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Space- or comma-separated scopes.
    pub scope: Option<String>,
    pub ttl_hours: Option<u64>,
    pub label: Option<String>,
}

impl TokenRequest {
    /// Parse a JSON or `application/x-www-form-urlencoded` body.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self, AppError> {
        let is_form = content_type
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        if !is_form {
            return serde_json::from_slice(body)
                .map_err(|e| AppError::InvalidPayload(format!("invalid token request: {}", e)));
        }

        let form: HashMap<String, String> = url::form_urlencoded::parse(body).into_owned().collect();
        let ttl_hours = match form.get("ttl_hours") {
            Some(raw) => Some(
                raw.trim()
                    .parse()
                    .map_err(|_| AppError::InvalidPayload("ttl_hours must be a non-negative integer".into()))?,
            ),
            None => None,
        };
        Ok(Self {
            grant_type: form.get("grant_type").cloned(),
            client_id: form.get("client_id").cloned(),
            client_secret: form.get("client_secret").cloned(),
            scope: form.get("scope").cloned(),
            ttl_hours,
            label: form.get("label").cloned(),
        })
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// `POST /oauth/token`: client-credentials grant.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(
        &headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.config.trust_forwarded_for,
    );
    match run_issue_token(&state, &ip, &headers, &body).await {
        Ok(token) => (StatusCode::OK, Json(token)).into_response(),
        Err(e) => e.into_envelope_response(None, Some(&state.config.resource_metadata_url())),
    }
}

async fn run_issue_token(
    state: &AppState,
    ip: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<TokenResponse, AppError> {
    state
        .limiter
        .enforce(Bucket::Token, &Caller::anonymous(ip).identity(), false)
        .await?;

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let request = TokenRequest::parse(content_type, body)?;

    if request.grant_type.as_deref() != Some("client_credentials") {
        return Err(AppError::InvalidPayload(
            "grant_type must be 'client_credentials'".into(),
        ));
    }
    verify_client(
        &state.config,
        request.client_id.as_deref(),
        request.client_secret.as_deref(),
        false,
    )?;

    let label = request
        .label
        .clone()
        .unwrap_or_else(|| format!("oauth:{}", request.client_id.as_deref().unwrap_or_default()));
    let issued = state
        .tokens
        .issue_token(
            &label,
            &request.scopes(),
            request.ttl_hours.unwrap_or(DEFAULT_TOKEN_TTL_HOURS),
        )
        .await?;
    Ok(TokenResponse::from(&issued))
}

// ── Ops ──────────────────────────────────────────────────────

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
