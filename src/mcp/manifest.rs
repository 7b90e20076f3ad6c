//! Discovery documents: the MCP manifest and the OAuth protected-resource
//! metadata.
//!
//! Both are rendered once, cached for five minutes and served with an
//! `ETag` so clients can revalidate with `If-None-Match`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::types::Command;
use crate::auth::tokens::KNOWN_SCOPES;
use crate::cache::TieredCache;
use crate::config::Config;
use crate::search::Schema;

pub const MCP_VERSION: &str = "2025-06-18";
pub const DISCOVERY_TTL_SECS: u64 = 300;

const MANIFEST_KEY: &str = "discovery:mcp";
const PROTECTED_RESOURCE_KEY: &str = "discovery:oauth-protected-resource";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub body: String,
    pub etag: String,
}

impl CachedDocument {
    pub fn new(document: &Value) -> Self {
        let body = document.to_string();
        let etag = etag_for(&body);
        Self { body, etag }
    }
}

/// Strong ETag over the serialized body.
pub fn etag_for(body: &str) -> String {
    let digest = Sha256::digest(body.as_bytes());
    format!("\"{}\"", &hex::encode(digest)[..32])
}

/// Whether an `If-None-Match` header value matches `etag`. Handles `*`,
/// lists and weak validators.
pub fn if_none_match_matches(header: &str, etag: &str) -> bool {
    header.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.strip_prefix("W/").unwrap_or(candidate) == etag
    })
}

pub fn build_manifest(config: &Config, schema: &Schema) -> Value {
    let scopes: Map<String, Value> = KNOWN_SCOPES
        .iter()
        .map(|(name, description)| (name.to_string(), Value::from(*description)))
        .collect();

    json!({
        "name": config.server_name,
        "version": env!("CARGO_PKG_VERSION"),
        "canonical": config.commands_url(),
        "mcpVersion": MCP_VERSION,
        "commands": Command::ALL.iter().map(Command::describe).collect::<Vec<_>>(),
        "resources": [
            {
                "name": "commands",
                "uri": config.commands_url(),
                "method": "POST",
                "description": "Command endpoint; body {command, params, requestId}",
            },
            {
                "name": "protected-resource-metadata",
                "uri": config.resource_metadata_url(),
                "method": "GET",
            },
            {
                "name": "token",
                "uri": config.endpoint("oauth/token"),
                "method": "POST",
                "description": "Client-credentials token endpoint",
            },
        ],
        "scopes": scopes,
        "abilities": {
            "search": {
                "postTypes": schema.names(),
                "pagination": "cursor",
                "filters": true,
                "maxPageSize": config.search.max_page_size,
            },
            "authentication": {
                "type": "bearer",
                "required": config.require_auth,
                "resourceMetadata": config.resource_metadata_url(),
            },
        },
    })
}

/// RFC 9728 protected-resource metadata.
pub fn build_protected_resource(config: &Config) -> Value {
    json!({
        "resource": config.commands_url(),
        "authorization_servers": [config.base_url.as_str().trim_end_matches('/')],
        "scopes_supported": KNOWN_SCOPES.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
        "bearer_methods_supported": ["header"],
        "resource_name": config.server_name,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

async fn cached_or_render<F>(cache: &TieredCache, key: &str, render: F) -> CachedDocument
where
    F: FnOnce() -> Value,
{
    if let Some(doc) = cache.get::<CachedDocument>(key).await {
        return doc;
    }
    let doc = CachedDocument::new(&render());
    if let Err(e) = cache.set(key, &doc, Some(DISCOVERY_TTL_SECS)).await {
        tracing::warn!(key = key, error = %e, "failed to cache discovery document");
    }
    doc
}

pub async fn manifest_document(cache: &TieredCache, config: &Config, schema: &Schema) -> CachedDocument {
    cached_or_render(cache, MANIFEST_KEY, || build_manifest(config, schema)).await
}

pub async fn protected_resource_document(cache: &TieredCache, config: &Config) -> CachedDocument {
    cached_or_render(cache, PROTECTED_RESOURCE_KEY, || build_protected_resource(config)).await
}
