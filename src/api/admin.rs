//! Index maintenance endpoints. Every route needs a token holding
//! `index.write`; anonymous callers are refused even when
//! `LOUPE_REQUIRE_AUTH` is off.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use super::handlers::client_ip;
use crate::auth::{authenticate, Caller};
use crate::errors::AppError;
use crate::mcp::types::Envelope;
use crate::middleware::rate_limit::Bucket;
use crate::AppState;

pub const INDEX_WRITE: &str = "index.write";

async fn authorize(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> Result<Caller, AppError> {
    let ip = client_ip(
        headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.config.trust_forwarded_for,
    );
    let token = authenticate(&state.tokens, headers, true).await?;
    let caller = Caller::new(ip, token);
    state
        .limiter
        .enforce(Bucket::Commands, &caller.identity(), caller.is_authenticated())
        .await?;
    caller.require_scope(INDEX_WRITE)?;
    Ok(caller)
}

fn respond(state: &AppState, result: Result<Value, AppError>) -> Response {
    match result {
        Ok(data) => Json(Envelope::success(data, None)).into_response(),
        Err(e) => {
            tracing::debug!(code = e.code(), "admin request failed");
            e.into_envelope_response(None, Some(&state.config.resource_metadata_url()))
        }
    }
}

fn parse_id(raw: &str) -> Result<u64, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::InvalidPayload(format!("post id must be a positive integer, got '{}'", raw)))
}

/// `POST /admin/posts/{id}/index`: re-read a post after it was created,
/// updated or unpublished.
pub async fn index_post(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let result = run_index_post(&state, connect_info, &headers, &id).await;
    respond(&state, result)
}

async fn run_index_post(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    id: &str,
) -> Result<Value, AppError> {
    let caller = authorize(state, connect_info, headers).await?;
    let id = parse_id(id)?;
    let outcome = state.indexer.index_post(id).await?;
    tracing::info!(post_id = id, outcome = outcome.as_str(), ip = %caller.ip, "index update");
    Ok(json!({"id": id, "outcome": outcome.as_str()}))
}

/// `POST /admin/posts/{id}/trash`
pub async fn trash_post(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let result = run_trash_post(&state, connect_info, &headers, &id).await;
    respond(&state, result)
}

async fn run_trash_post(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    id: &str,
) -> Result<Value, AppError> {
    authorize(state, connect_info, headers).await?;
    let id = parse_id(id)?;
    let removed = state.indexer.trash_post(id).await?;
    Ok(json!({"id": id, "removed": removed}))
}

/// `DELETE /admin/index/{post_type}/{id}`: drop a hard-deleted post.
pub async fn delete_post(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path((post_type, id)): Path<(String, String)>,
) -> Response {
    let result = run_delete_post(&state, connect_info, &headers, &post_type, &id).await;
    respond(&state, result)
}

async fn run_delete_post(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
    post_type: &str,
    id: &str,
) -> Result<Value, AppError> {
    authorize(state, connect_info, headers).await?;
    let id = parse_id(id)?;
    if !state.engine.schema().contains(post_type) {
        return Err(AppError::InvalidPostType(post_type.to_string()));
    }
    let removed = state.indexer.delete_post(post_type, id).await?;
    Ok(json!({"postType": post_type, "id": id, "removed": removed}))
}

/// `POST /admin/reindex`: rebuild every collection from the content store.
pub async fn reindex(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let result = run_reindex(&state, connect_info, &headers).await;
    respond(&state, result)
}

async fn run_reindex(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> Result<Value, AppError> {
    authorize(state, connect_info, headers).await?;
    let counts = state.indexer.reindex_all().await?;
    tracing::info!(?counts, "index rebuilt on request");
    Ok(json!({"counts": counts}))
}
