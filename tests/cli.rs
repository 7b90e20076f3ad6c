mod common;

use std::net::SocketAddr;

use loupe_mcp::cli::{render_issued_token, render_token_list, request_reindex, IssuedTokenOutput, OutputFormat};

/// Hash column of every row `list-tokens` prints.
fn listed_hashes(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn listed_hash_revokes_the_token() {
    let app = common::app().await;
    let tokens = &app.state.tokens;
    let keep = tokens.issue_token("keep", &["search.read"], 1).await.unwrap();
    let revoked = tokens.issue_token("drop", &["search.read"], 1).await.unwrap();

    let listing = render_token_list(&tokens.list_tokens().await.unwrap());
    let hashes = listed_hashes(&listing);
    assert_eq!(hashes.len(), 2);
    assert!(hashes.contains(&revoked.hash));

    let printed = hashes.iter().find(|h| **h == revoked.hash).unwrap();
    assert!(tokens.revoke_token(printed).await.unwrap());
    assert!(tokens.validate_bearer(&revoked.access_token).await.is_err());
    assert!(tokens.validate_bearer(&keep.access_token).await.is_ok());
}

#[tokio::test]
async fn issue_output_carries_a_revocable_hash() {
    let app = common::app().await;
    let tokens = &app.state.tokens;
    let issued = tokens.issue_token("ci", &["search.read"], 1).await.unwrap();

    let json = render_issued_token(&IssuedTokenOutput::from(&issued), OutputFormat::Json).unwrap();
    let printed: serde_json::Value = serde_json::from_str(&json).unwrap();
    let hash = printed["hash"].as_str().unwrap();
    assert_eq!(hash, issued.hash);

    // operators usually paste just the first few characters
    assert!(tokens.revoke_token(&hash[..12]).await.unwrap());
    assert!(tokens.validate_bearer(&issued.access_token).await.is_err());
    assert_eq!(render_token_list(&tokens.list_tokens().await.unwrap()), "No tokens issued.");
}

#[tokio::test]
async fn reindex_command_reaches_running_server() {
    let app = common::app().await;
    let writer = app.state.tokens.issue_token("ops", &["index.write"], 1).await.unwrap();
    let reader = app.state.tokens.issue_token("agent", &["search.read"], 1).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    let endpoint = format!("http://{}/admin/reindex", addr);

    let counts = request_reindex(&endpoint, &writer.access_token).await.unwrap();
    assert_eq!(counts.get("post"), Some(&3));
    assert_eq!(counts.get("page"), Some(&1));

    let err = request_reindex(&endpoint, &reader.access_token).await.unwrap_err();
    assert!(err.to_string().contains("insufficient_scope"));
}
