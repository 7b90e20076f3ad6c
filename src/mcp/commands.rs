//! Command handlers behind `POST /commands`.

use std::time::Instant;

use serde_json::{json, Map, Value};

use super::types::{Command, CommandRequest};
use crate::auth::Caller;
use crate::content::Post;
use crate::errors::AppError;
use crate::middleware::rate_limit::Bucket;
use crate::search::engine::{apply_filters, parse_filters, SearchHit};
use crate::search::{query_fingerprint, CursorParts};
use crate::AppState;

/// Fields a caller may ask for in search results.
pub const FIELD_WHITELIST: &[&str] = &[
    "id",
    "title",
    "excerpt",
    "url",
    "date",
    "modified",
    "author",
    "postType",
    "slug",
    "taxonomies",
];

/// Route a parsed request to its handler after the scope check.
pub async fn dispatch(state: &AppState, caller: &Caller, request: &CommandRequest) -> Result<Value, AppError> {
    let command = Command::from_name(&request.command)
        .ok_or_else(|| AppError::UnknownCommand(request.command.clone()))?;
    caller.require_scope(command.scope())?;

    tracing::debug!(command = command.name(), authenticated = caller.is_authenticated(), "dispatching command");

    match command {
        Command::SearchPosts => search_posts(state, caller, &request.params).await,
        Command::GetPost => get_post(state, &request.params).await,
        Command::GetSchema => get_schema(state, &request.params),
        Command::HealthCheck => Ok(health_check(state).await),
        Command::ListCommands => Ok(list_commands()),
    }
}

fn empty_search() -> Value {
    json!({
        "hits": [],
        "tookMs": 0,
        "pageInfo": { "nextCursor": null },
    })
}

async fn search_posts(state: &AppState, caller: &Caller, params: &Map<String, Value>) -> Result<Value, AppError> {
    let query = match params.get("query") {
        None | Some(Value::Null) => "",
        Some(Value::String(s)) => s.trim(),
        Some(_) => return Err(AppError::InvalidPayload("query must be a string".into())),
    };
    if query.is_empty() {
        return Ok(empty_search());
    }

    let schema = state.engine.schema();
    let post_types = resolve_post_types(params.get("postTypes"), &schema.names())?;
    let page_size = resolve_page_size(
        params.get("pageSize"),
        state.config.search.default_page_size,
        state.config.search.max_page_size,
    )?;
    let filters = parse_filters(params.get("filters").unwrap_or(&Value::Null), schema, &post_types)?;
    let fields = resolve_fields(params.get("fields"));

    state
        .limiter
        .enforce(Bucket::Search, &caller.identity(), caller.is_authenticated())
        .await?;

    let started = Instant::now();
    let hits = apply_filters(state.engine.search(query, &post_types).await, &filters);
    let total = hits.len();

    let cursor = params.get("cursor").and_then(Value::as_str);
    let offset = state.cursors.resume_offset(cursor, query);

    let page: Vec<Value> = hits
        .iter()
        .skip(offset)
        .take(page_size)
        .map(|h| project_hit(h, &fields))
        .collect();

    let next_cursor = (offset + page_size < total).then(|| {
        state.cursors.encode(&CursorParts {
            offset: offset + page_size,
            query_hash: query_fingerprint(query),
        })
    });

    Ok(json!({
        "hits": page,
        "total": total,
        "tookMs": started.elapsed().as_millis() as u64,
        "pageInfo": {
            "nextCursor": next_cursor,
            "offset": offset,
            "pageSize": page_size,
        },
    }))
}

/// Requested post types, or every configured type when none are given.
/// Duplicates are dropped, first occurrence wins.
fn resolve_post_types(raw: Option<&Value>, configured: &[String]) -> Result<Vec<String>, AppError> {
    let requested = match raw {
        None | Some(Value::Null) => return Ok(configured.to_vec()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(AppError::InvalidPostTypes),
    };
    if requested.is_empty() {
        return Ok(configured.to_vec());
    }

    let mut post_types: Vec<String> = Vec::with_capacity(requested.len());
    for item in requested {
        let name = item.as_str().ok_or(AppError::InvalidPostTypes)?.trim();
        if !configured.iter().any(|c| c == name) {
            return Err(AppError::InvalidPostType(name.to_string()));
        }
        if !post_types.iter().any(|p| p == name) {
            post_types.push(name.to_string());
        }
    }
    Ok(post_types)
}

fn resolve_page_size(raw: Option<&Value>, default: usize, max: usize) -> Result<usize, AppError> {
    let size = match raw {
        None | Some(Value::Null) => return Ok(default.clamp(1, max)),
        Some(v) => v.as_u64().ok_or(AppError::InvalidPageSize { max })?,
    };
    if size == 0 || size > max as u64 {
        return Err(AppError::InvalidPageSize { max });
    }
    Ok(size as usize)
}

/// Requested fields intersected with the whitelist. `id` is always present;
/// an absent or empty request means every whitelisted field.
pub fn resolve_fields(raw: Option<&Value>) -> Vec<&'static str> {
    let requested: Vec<&str> = match raw {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        Some(Value::String(s)) => s.split(',').map(str::trim).filter(|f| !f.is_empty()).collect(),
        _ => Vec::new(),
    };
    if requested.is_empty() {
        return FIELD_WHITELIST.to_vec();
    }

    FIELD_WHITELIST
        .iter()
        .copied()
        .filter(|f| *f == "id" || requested.contains(f))
        .collect()
}

fn taxonomies_of(fields: &Map<String, Value>) -> Value {
    let taxonomies: Map<String, Value> = fields
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("taxonomy_").map(|name| (name.to_string(), v.clone())))
        .collect();
    Value::Object(taxonomies)
}

/// Public shape of a hit, limited to `fields`.
pub fn project_hit(hit: &SearchHit, fields: &[&str]) -> Value {
    let source = |key: &str| hit.fields.get(key).cloned().unwrap_or(Value::Null);

    let mut out = Map::new();
    for field in fields {
        let value = match *field {
            "id" => Value::from(hit.id),
            "title" => source("post_title"),
            "excerpt" => source("post_excerpt"),
            "url" => source("permalink"),
            "date" => source("post_date"),
            "modified" => source("post_modified"),
            "author" => source("post_author"),
            "postType" => Value::from(hit.post_type.clone()),
            "slug" => source("post_name"),
            "taxonomies" => taxonomies_of(&hit.fields),
            _ => continue,
        };
        out.insert((*field).to_string(), value);
    }
    Value::Object(out)
}

fn parse_post_id(raw: Option<&Value>) -> Result<u64, AppError> {
    let invalid = || AppError::InvalidPayload("id must be a positive integer".into());
    match raw {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

async fn get_post(state: &AppState, params: &Map<String, Value>) -> Result<Value, AppError> {
    let id = parse_post_id(params.get("id"))?;

    let post = match state.content.fetch_post(id).await? {
        Some(p) if p.is_published() && state.engine.schema().contains(&p.post_type) => p,
        _ => return Ok(json!({})),
    };
    let terms = state.content.terms_for(id).await?;
    Ok(post_view(&post, terms))
}

fn post_view(post: &Post, terms: crate::content::Terms) -> Value {
    json!({
        "id": post.id,
        "title": post.title,
        "content": post.content,
        "excerpt": post.excerpt,
        "url": post.permalink,
        "date": post.date.to_rfc3339(),
        "modified": post.modified.to_rfc3339(),
        "author": post.author,
        "postType": post.post_type,
        "slug": post.slug,
        "taxonomies": terms,
    })
}

fn get_schema(state: &AppState, params: &Map<String, Value>) -> Result<Value, AppError> {
    let schema = state.engine.schema();
    let selected: Vec<_> = match params.get("postType") {
        None | Some(Value::Null) => schema.post_types().iter().collect(),
        Some(Value::String(name)) => {
            vec![schema
                .get(name)
                .ok_or_else(|| AppError::InvalidPostType(name.clone()))?]
        }
        Some(_) => return Err(AppError::InvalidPayload("postType must be a string".into())),
    };

    let mut post_types = Map::new();
    for pt in selected {
        post_types.insert(
            pt.name.clone(),
            json!({
                "label": pt.label.clone().unwrap_or_else(|| pt.name.clone()),
                "fields": pt.fields,
            }),
        );
    }
    Ok(json!({ "postTypes": post_types }))
}

async fn health_check(state: &AppState) -> Value {
    let counts = state.engine.document_counts().await;
    let healthy = counts.values().all(Option::is_some);
    json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "postTypes": state.engine.schema().names(),
        "indexes": counts,
        "store": if state.cache.is_persistent() { "redis" } else { "memory" },
    })
}

fn list_commands() -> Value {
    json!({
        "commands": Command::ALL.iter().map(Command::describe).collect::<Vec<_>>(),
    })
}
