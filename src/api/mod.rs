use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::middleware::security::{request_id_middleware, security_headers_middleware};
use crate::AppState;

pub mod admin;
pub mod handlers;

/// Largest accepted request body.
const BODY_LIMIT_BYTES: usize = 64 * 1024;

/// Build the public router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/commands", post(handlers::commands))
        .route("/.well-known/mcp.json", get(handlers::mcp_manifest))
        .route(
            "/.well-known/oauth-protected-resource",
            get(handlers::protected_resource),
        )
        .route("/oauth/token", post(handlers::issue_token))
        .route("/admin/posts/:id/index", post(admin::index_post))
        .route("/admin/posts/:id/trash", post(admin::trash_post))
        .route("/admin/index/:post_type/:id", delete(admin::delete_post))
        .route("/admin/reindex", post(admin::reindex))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http())
        // MCP clients may run in a browser; no cookies are involved
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::IF_NONE_MATCH,
                ])
                .expose_headers([header::ETAG, header::RETRY_AFTER, header::WWW_AUTHENTICATE]),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}
