mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};

use common::{app, app_with, command};

fn ids(data: &Value) -> Vec<u64> {
    data["hits"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["id"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn search_merges_post_types_by_score() {
    let app = app().await;
    let (status, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust"}, "requestId": "req-1"}),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["error"], Value::Null);
    assert_eq!(body["requestId"], "req-1");

    let data = &body["data"];
    // post 1 (title + 2x content), page 4 (title + content), post 2 (content)
    assert_eq!(ids(data), vec![1, 4, 2]);
    assert_eq!(data["total"], 3);
    assert_eq!(data["pageInfo"]["nextCursor"], Value::Null);
    assert_eq!(data["pageInfo"]["offset"], 0);
    assert_eq!(data["pageInfo"]["pageSize"], 10);

    let first = &data["hits"][0];
    assert_eq!(first["title"], "Rust gateway");
    assert_eq!(first["url"], "https://blog.example.test/rust-gateway");
    assert_eq!(first["postType"], "post");
    assert_eq!(first["taxonomies"], json!({"category": ["Engineering"]}));
}

#[tokio::test]
async fn drafts_are_never_returned() {
    let app = app().await;
    let (_, _, body) = command(&app, json!({"command": "searchPosts", "params": {"query": "unreleased"}}), None).await;
    assert_eq!(body["data"]["hits"], json!([]));

    let (_, _, body) = command(&app, json!({"command": "getPost", "params": {"id": 3}}), None).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!({}));
}

#[tokio::test]
async fn empty_query_short_circuits_before_search_limit() {
    let app = app_with(&[("LOUPE_MAX_SEARCH_ANON", "1")]).await;

    for query in ["", "   "] {
        let (status, _, body) = command(&app, json!({"command": "searchPosts", "params": {"query": query}}), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!({"hits": [], "tookMs": 0, "pageInfo": {"nextCursor": null}}));
    }

    // the search bucket is still untouched
    let (status, _, _) = command(&app, json!({"command": "searchPosts", "params": {"query": "rust"}}), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = command(&app, json!({"command": "searchPosts", "params": {"query": "rust"}}), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "rate_limited");
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
}

#[tokio::test]
async fn cursor_walks_all_pages() {
    let app = app().await;
    let mut cursor: Option<String> = None;
    let mut seen = Vec::new();

    for _ in 0..5 {
        let mut params = json!({"query": "rust", "pageSize": 1});
        if let Some(c) = &cursor {
            params["cursor"] = json!(c);
        }
        let (_, _, body) = command(&app, json!({"command": "searchPosts", "params": params}), None).await;
        let data = &body["data"];
        seen.extend(ids(data));
        match data["pageInfo"]["nextCursor"].as_str() {
            Some(next) => cursor = Some(next.to_string()),
            None => break,
        }
    }
    assert_eq!(seen, vec![1, 4, 2]);
}

#[tokio::test]
async fn cursor_from_other_query_restarts_at_zero() {
    let app = app().await;
    let (_, _, body) = command(&app, json!({"command": "searchPosts", "params": {"query": "rust", "pageSize": 1}}), None).await;
    let cursor = body["data"]["pageInfo"]["nextCursor"].as_str().unwrap().to_string();

    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "roses", "cursor": cursor}}),
        None,
    )
    .await;
    assert_eq!(body["data"]["pageInfo"]["offset"], 0);
    assert_eq!(ids(&body["data"]), vec![5]);

    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "cursor": "forged"}}),
        None,
    )
    .await;
    assert_eq!(body["data"]["pageInfo"]["offset"], 0);
}

#[tokio::test]
async fn field_projection_stays_in_whitelist() {
    let app = app().await;
    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "fields": ["title", "post_content", "status"]}}),
        None,
    )
    .await;
    for hit in body["data"]["hits"].as_array().unwrap() {
        let keys: Vec<&String> = hit.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2, "unexpected keys {:?}", keys);
        assert!(hit.get("id").is_some() && hit.get("title").is_some());
    }

    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "fields": ["id"]}}),
        None,
    )
    .await;
    for hit in body["data"]["hits"].as_array().unwrap() {
        assert_eq!(hit.as_object().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn filters_and_post_type_selection() {
    let app = app().await;
    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "filters": {"post_author": "ann"}}}),
        None,
    )
    .await;
    assert_eq!(ids(&body["data"]), vec![1]);

    let (_, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "postTypes": ["page"]}}),
        None,
    )
    .await;
    assert_eq!(ids(&body["data"]), vec![4]);

    let (status, _, body) = command(
        &app,
        json!({"command": "searchPosts", "params": {"query": "rust", "postTypes": ["page"], "filters": {"post_author": "ann"}}}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unallowlisted_field");
}

#[tokio::test]
async fn validation_errors() {
    let app = app().await;
    let cases = [
        (json!({"params": {}}), StatusCode::BAD_REQUEST, "missing_command"),
        (json!({"command": "dropTables"}), StatusCode::BAD_REQUEST, "unknown_command"),
        (json!({"command": "searchPosts", "params": [1]}), StatusCode::BAD_REQUEST, "invalid_payload"),
        (json!({"command": "searchPosts", "params": {"query": "rust", "pageSize": 0}}), StatusCode::BAD_REQUEST, "invalid_page_size"),
        (json!({"command": "searchPosts", "params": {"query": "rust", "pageSize": 101}}), StatusCode::BAD_REQUEST, "invalid_page_size"),
        (json!({"command": "searchPosts", "params": {"query": "rust", "postTypes": "post"}}), StatusCode::BAD_REQUEST, "invalid_post_types"),
        (json!({"command": "searchPosts", "params": {"query": "rust", "postTypes": ["product"]}}), StatusCode::NOT_FOUND, "invalid_post_type"),
        (json!({"command": "searchPosts", "params": {"query": "rust", "filters": {"post_author": {"a": 1}}}}), StatusCode::BAD_REQUEST, "invalid_filter"),
        (json!({"command": "getPost", "params": {"id": "abc"}}), StatusCode::BAD_REQUEST, "invalid_payload"),
        (json!({"command": "getSchema", "params": {"postType": "product"}}), StatusCode::NOT_FOUND, "invalid_post_type"),
    ];

    for (request, expected_status, expected_code) in cases {
        let (status, _, body) = command(&app, request.clone(), None).await;
        assert_eq!(status, expected_status, "{}", request);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], expected_code, "{}", request);
        assert!(body["error"]["message"].as_str().is_some_and(|m| !m.is_empty()));
        assert_eq!(body["data"], Value::Null);
    }
}

#[tokio::test]
async fn invalid_json_body_is_an_envelope_error() {
    let app = app().await;
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/commands")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let (status, _, body) = common::send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_payload");
    assert_eq!(body["requestId"], Value::Null);
}

#[tokio::test]
async fn get_post_returns_published_content() {
    let app = app().await;
    let (_, _, body) = command(&app, json!({"command": "getPost", "params": {"id": "1"}}), None).await;
    let data = &body["data"];
    assert_eq!(data["id"], 1);
    assert_eq!(data["title"], "Rust gateway");
    assert_eq!(data["content"], "rust rust");
    assert_eq!(data["taxonomies"], json!({"category": ["Engineering"]}));

    let (_, _, body) = command(&app, json!({"command": "getPost", "params": {"id": 999}}), None).await;
    assert_eq!(body["data"], json!({}));
}

#[tokio::test]
async fn introspection_commands() {
    let app = app().await;

    let (_, _, body) = command(&app, json!({"command": "listCommands"}), None).await;
    let names: Vec<&str> = body["data"]["commands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["searchPosts", "getPost", "getSchema", "healthCheck", "listCommands"]);

    let (_, _, body) = command(&app, json!({"command": "getSchema", "params": {"postType": "post"}}), None).await;
    let fields = &body["data"]["postTypes"]["post"]["fields"];
    assert_eq!(fields["post_content"]["sortable"], false);
    assert_eq!(fields["post_title"]["weight"], 2.0);

    let (_, _, body) = command(&app, json!({"command": "healthCheck"}), None).await;
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["indexes"]["post"], 3);
    assert_eq!(body["data"]["indexes"]["page"], 1);
}

#[tokio::test]
async fn commands_bucket_hard_stops() {
    let app = app_with(&[("LOUPE_RATE_ANON_LIMIT", "2"), ("LOUPE_RATE_ANON_WINDOW", "60")]).await;

    for _ in 0..2 {
        let (status, _, _) = command(&app, json!({"command": "listCommands"}), None).await;
        assert_eq!(status, StatusCode::OK);
    }
    for _ in 0..2 {
        let (status, headers, body) = command(&app, json!({"command": "listCommands"}), None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(headers.contains_key("retry-after"));
        assert_eq!(body["error"]["code"], "rate_limited");
    }
}

#[tokio::test]
async fn metrics_count_commands() {
    let app = app().await;
    command(&app, json!({"command": "listCommands"}), None).await;
    command(&app, json!({"command": "nope"}), None).await;

    let (status, _, body) = common::send(&app, common::get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("loupe_commands_total"));
    assert!(text.contains("unknown_command"));
}
