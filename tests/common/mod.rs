#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use loupe_mcp::config::Config;
use loupe_mcp::content::MemoryContentStore;
use loupe_mcp::{api, AppState};

pub const SEED: &str = r#"[
    {"id": 1, "post_type": "post", "status": "publish", "title": "Rust gateway",
     "content": "rust rust", "author": "ann", "slug": "rust-gateway",
     "permalink": "https://blog.example.test/rust-gateway",
     "date": "2024-01-01T00:00:00Z", "modified": "2024-01-05T00:00:00Z",
     "terms": {"category": ["Engineering"]}},
    {"id": 2, "post_type": "post", "status": "publish", "title": "Cooking",
     "content": "rust on pans", "author": "bob", "slug": "cooking",
     "date": "2024-02-01T00:00:00Z", "modified": "2024-02-01T00:00:00Z",
     "terms": {"category": ["Kitchen"]}},
    {"id": 3, "post_type": "post", "status": "draft", "title": "Rust secrets",
     "content": "unreleased rust plans", "author": "ann",
     "date": "2024-03-01T00:00:00Z", "modified": "2024-03-01T00:00:00Z"},
    {"id": 4, "post_type": "page", "status": "publish", "title": "About Rust",
     "content": "we like rust", "author": "cy", "slug": "about",
     "date": "2023-06-01T00:00:00Z", "modified": "2023-06-01T00:00:00Z"},
    {"id": 5, "post_type": "post", "status": "publish", "title": "Gardening",
     "content": "roses and tulips", "author": "ann",
     "date": "2024-04-01T00:00:00Z", "modified": "2024-04-01T00:00:00Z"}
]"#;

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

/// Build an app over the seed content with extra environment overrides.
pub async fn app_with(vars: &[(&str, &str)]) -> TestApp {
    let mut env: HashMap<String, String> = HashMap::from([
        ("LOUPE_SITE_SECRET".to_string(), "integration-test-secret-0123456789abcdef".to_string()),
        ("LOUPE_BASE_URL".to_string(), "https://search.example.test".to_string()),
    ]);
    for (k, v) in vars {
        env.insert(k.to_string(), v.to_string());
    }
    let config = Config::from_lookup(|key| env.get(key).cloned()).unwrap();

    let content = Arc::new(MemoryContentStore::from_json(SEED).unwrap());
    let state = Arc::new(AppState::in_memory(config, content).unwrap());
    state.indexer.reindex_all().await.unwrap();

    TestApp {
        router: api::router(state.clone()),
        state,
    }
}

pub async fn app() -> TestApp {
    app_with(&[]).await
}

pub async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let resp: Response = app.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, headers, body)
}

pub fn command_request(body: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/commands")
        .header("content-type", "application/json");
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {}", t));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn command(app: &TestApp, body: Value, token: Option<&str>) -> (StatusCode, axum::http::HeaderMap, Value) {
    send(app, command_request(&body, token)).await
}

/// Empty-bodied request with an optional bearer token.
pub fn authed(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(t) = token {
        builder = builder.header("authorization", format!("Bearer {}", t));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
