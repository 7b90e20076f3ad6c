//! Multi-post-type search: one index query per post type, merged into a
//! single relevance-ordered list and cached until content changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::index::{CollectionSettings, FieldFilter, IndexQuery, SearchIndex};
use super::schema::{PostTypeSchema, Schema};
use crate::cache::TieredCache;
use crate::config::SearchConfig;
use crate::errors::AppError;
use crate::middleware::metrics::Metrics;

/// Holds the current cache generation; bumping it orphans every cached
/// result set at once.
const GENERATION_KEY: &str = "search_cache_gen";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: u64,
    pub post_type: String,
    pub score: f64,
    pub fields: Map<String, Value>,
}

/// Index settings for one post type's collection.
pub fn collection_settings(schema: &PostTypeSchema) -> CollectionSettings {
    CollectionSettings {
        searchable: schema.indexable_fields(),
        filterable: schema.filterable_fields(),
        sortable: schema
            .sortable_fields()
            .into_iter()
            .map(|(name, _)| name)
            .collect(),
    }
}

/// Concatenate per-type batches (in request order) and sort by score,
/// highest first. The sort is stable so equal scores keep engine order.
pub fn merge_hits(batches: Vec<Vec<SearchHit>>) -> Vec<SearchHit> {
    let mut merged: Vec<SearchHit> = batches.into_iter().flatten().collect();
    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged
}

/// Parse the `filters` param: an object of `field -> scalar | [scalars]`.
///
/// Each field must be filterable in at least one of `post_types`.
pub fn parse_filters(raw: &Value, schema: &Schema, post_types: &[String]) -> Result<Vec<FieldFilter>, AppError> {
    let obj = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Object(obj) => obj,
        _ => return Err(AppError::InvalidFilter("filters must be an object".into())),
    };

    let mut filters = Vec::with_capacity(obj.len());
    for (field, value) in obj {
        let allowed = post_types.iter().any(|pt| {
            schema
                .get(pt)
                .and_then(|s| s.fields.get(field))
                .map(|f| f.filterable)
                .unwrap_or(false)
        });
        if !allowed {
            return Err(AppError::UnallowlistedField(field.clone()));
        }

        let values = match value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        if values.is_empty() || values.iter().any(|v| !is_scalar(v)) {
            return Err(AppError::InvalidFilter(format!(
                "filter '{}' must be a scalar or a non-empty list of scalars",
                field
            )));
        }
        filters.push(FieldFilter {
            field: field.clone(),
            values,
        });
    }
    Ok(filters)
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

pub fn apply_filters(hits: Vec<SearchHit>, filters: &[FieldFilter]) -> Vec<SearchHit> {
    if filters.is_empty() {
        return hits;
    }
    hits.into_iter()
        .filter(|hit| filters.iter().all(|f| f.matches(&hit.fields)))
        .collect()
}

pub struct SearchEngine {
    index: Arc<dyn SearchIndex>,
    schema: Arc<Schema>,
    cache: TieredCache,
    config: SearchConfig,
    metrics: Option<Arc<Metrics>>,
}

impl SearchEngine {
    pub fn new(index: Arc<dyn SearchIndex>, schema: Arc<Schema>, cache: TieredCache, config: SearchConfig) -> Self {
        Self {
            index,
            schema,
            cache,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Open every configured collection, creating missing ones.
    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        for pt in self.schema.post_types() {
            self.index.ensure_index(&pt.name, collection_settings(pt)).await?;
        }
        Ok(())
    }

    pub fn build_query(&self, schema: &PostTypeSchema, text: &str) -> IndexQuery {
        IndexQuery {
            text: text.to_string(),
            fields: schema.indexable_fields(),
            filters: Vec::new(),
            sort: schema.sortable_fields(),
            limit: self.config.max_results_per_type,
            offset: 0,
        }
    }

    /// Run `query` against every post type and return the merged hits.
    ///
    /// A post type that fails (unconfigured, missing index, bad sort
    /// attribute) is logged and skipped. Results are cached until the next
    /// `invalidate_cache`.
    pub async fn search(&self, query: &str, post_types: &[String]) -> Vec<SearchHit> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let key = self.cache_key(query, post_types).await;
        if let Some(hits) = self.cache.get::<Vec<SearchHit>>(&key).await {
            self.record_cache(true);
            return hits;
        }
        self.record_cache(false);

        let mut batches = Vec::with_capacity(post_types.len());
        for post_type in post_types {
            let Some(schema) = self.schema.get(post_type) else {
                tracing::warn!(post_type = %post_type, "search skipped unconfigured post type");
                continue;
            };
            let index_query = self.build_query(schema, query);
            match self.index.search(post_type, &index_query).await {
                Ok(hits) => batches.push(
                    hits.into_iter()
                        .map(|h| SearchHit {
                            id: h.id,
                            post_type: post_type.clone(),
                            score: h.score,
                            fields: h.fields,
                        })
                        .collect(),
                ),
                Err(e) => {
                    tracing::warn!(post_type = %post_type, error = %e, "post type search failed, skipping");
                }
            }
        }

        let merged = merge_hits(batches);
        if let Err(e) = self
            .cache
            .set(&key, &merged, Some(self.config.cache_ttl_secs))
            .await
        {
            tracing::warn!(error = %e, "failed to cache search results");
        }
        merged
    }

    /// Drop every cached result set.
    pub async fn invalidate_cache(&self) -> anyhow::Result<()> {
        let generation = uuid::Uuid::new_v4().to_string();
        self.cache.set(GENERATION_KEY, &generation, None).await?;
        tracing::debug!(generation = %generation, "search cache invalidated");
        Ok(())
    }

    /// Document count per configured collection; `None` when the collection
    /// cannot be read.
    pub async fn document_counts(&self) -> BTreeMap<String, Option<usize>> {
        let mut counts = BTreeMap::new();
        for name in self.schema.names() {
            let count = match self.index.document_count(&name).await {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::debug!(post_type = %name, error = %e, "document count unavailable");
                    None
                }
            };
            counts.insert(name, count);
        }
        counts
    }

    async fn cache_key(&self, query: &str, post_types: &[String]) -> String {
        let generation = match self.cache.get_authoritative::<String>(GENERATION_KEY).await {
            Ok(Some(g)) => g,
            Ok(None) => "0".to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read search cache generation");
                "0".to_string()
            }
        };
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(b"|");
        hasher.update(post_types.join(",").as_bytes());
        format!("search:{}:{}", generation, hex::encode(hasher.finalize()))
    }

    fn record_cache(&self, hit: bool) {
        if let Some(m) = &self.metrics {
            m.record_search_cache(hit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::index::{Document, MemoryIndex};
    use serde_json::json;

    fn hit(id: u64, post_type: &str, score: f64) -> SearchHit {
        SearchHit {
            id,
            post_type: post_type.into(),
            score,
            fields: Map::new(),
        }
    }

    fn search_config() -> SearchConfig {
        SearchConfig {
            max_results_per_type: 200,
            cache_ttl_secs: 3600,
            default_page_size: 10,
            max_page_size: 100,
        }
    }

    async fn engine_with(docs: Vec<(&str, u64, Value)>) -> (SearchEngine, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::new());
        let schema = Arc::new(Schema::default_schema());
        let engine = SearchEngine::new(index.clone(), schema, TieredCache::in_memory(), search_config());
        engine.ensure_indexes().await.unwrap();
        for (pt, id, fields) in docs {
            index
                .add_documents(
                    pt,
                    vec![Document {
                        id,
                        fields: fields.as_object().cloned().unwrap(),
                    }],
                )
                .await
                .unwrap();
        }
        (engine, index)
    }

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_merge_sorts_descending_and_paginates() {
        let batches = vec![
            vec![hit(1, "post", 2.5), hit(2, "post", 7.1), hit(3, "post", 5.0)],
            vec![hit(4, "page", 1.2), hit(5, "page", 9.4), hit(6, "page", 9.4)],
        ];
        let merged = merge_hits(batches);
        let scores: Vec<f64> = merged.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![9.4, 9.4, 7.1, 5.0, 2.5, 1.2]);

        // equal scores keep engine order
        assert_eq!(merged[0].id, 5);
        assert_eq!(merged[1].id, 6);

        let page: Vec<f64> = merged.iter().skip(0).take(2).map(|h| h.score).collect();
        assert_eq!(page, vec![9.4, 9.4]);
        let page: Vec<f64> = merged.iter().skip(2).take(2).map(|h| h.score).collect();
        assert_eq!(page, vec![7.1, 5.0]);
    }

    #[test]
    fn test_merge_ties_follow_post_type_order() {
        let merged = merge_hits(vec![vec![hit(1, "page", 3.0)], vec![hit(2, "post", 3.0)]]);
        assert_eq!(merged.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_parse_filters() {
        let schema = Schema::default_schema();
        let filters = parse_filters(
            &json!({"post_author": "ann", "taxonomy_category": ["News", "Tech"]}),
            &schema,
            &types(&["post"]),
        )
        .unwrap();
        assert_eq!(filters.len(), 2);

        assert!(parse_filters(&Value::Null, &schema, &types(&["post"])).unwrap().is_empty());

        let err = parse_filters(&json!({"post_author": "ann"}), &schema, &types(&["page"])).unwrap_err();
        assert_eq!(err.code(), "unallowlisted_field");

        let err = parse_filters(&json!({"post_author": {"$ne": 1}}), &schema, &types(&["post"])).unwrap_err();
        assert_eq!(err.code(), "invalid_filter");

        let err = parse_filters(&json!({"post_author": []}), &schema, &types(&["post"])).unwrap_err();
        assert_eq!(err.code(), "invalid_filter");

        let err = parse_filters(&json!(["post_author"]), &schema, &types(&["post"])).unwrap_err();
        assert_eq!(err.code(), "invalid_filter");
    }

    #[tokio::test]
    async fn test_search_merges_post_types() {
        let (engine, _) = engine_with(vec![
            ("post", 1, json!({"post_title": "Loupe search", "post_date": "2024-01-01"})),
            ("page", 2, json!({"post_title": "About", "post_content": "loupe"})),
        ])
        .await;

        let hits = engine.search("loupe", &types(&["post", "page"])).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].post_type, "post");
        assert_eq!(hits[1].post_type, "page");
        assert!(hits[0].score > hits[1].score);

        assert!(engine.search("   ", &types(&["post"])).await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_post_type_is_skipped() {
        let index = Arc::new(MemoryIndex::new());
        let engine = SearchEngine::new(
            index.clone(),
            Arc::new(Schema::default_schema()),
            TieredCache::in_memory(),
            search_config(),
        );
        // only "post" has a collection
        let post = engine.schema().get("post").unwrap().clone();
        index.create_index("post", collection_settings(&post)).await.unwrap();
        index
            .add_documents(
                "post",
                vec![Document {
                    id: 7,
                    fields: json!({"post_title": "hello"}).as_object().cloned().unwrap(),
                }],
            )
            .await
            .unwrap();

        let hits = engine.search("hello", &types(&["page", "post", "product"])).await;
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![7]);
    }

    #[tokio::test]
    async fn test_results_cached_until_invalidated() {
        let (engine, index) = engine_with(vec![("post", 1, json!({"post_title": "cache me"}))]).await;
        let post_types = types(&["post"]);

        assert_eq!(engine.search("cache", &post_types).await.len(), 1);

        index
            .add_documents(
                "post",
                vec![Document {
                    id: 2,
                    fields: json!({"post_title": "cache too"}).as_object().cloned().unwrap(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(engine.search("cache", &post_types).await.len(), 1);

        engine.invalidate_cache().await.unwrap();
        assert_eq!(engine.search("cache", &post_types).await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_filters_after_merge() {
        let (engine, _) = engine_with(vec![
            ("post", 1, json!({"post_title": "alpha", "post_author": "ann"})),
            ("post", 2, json!({"post_title": "alpha", "post_author": "bob"})),
            ("page", 3, json!({"post_title": "alpha"})),
        ])
        .await;
        let post_types = types(&["post", "page"]);
        let hits = engine.search("alpha", &post_types).await;
        assert_eq!(hits.len(), 3);

        let filters = parse_filters(&json!({"post_author": ["ann"]}), engine.schema(), &post_types).unwrap();
        let filtered = apply_filters(hits, &filters);
        assert_eq!(filtered.iter().map(|h| h.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_document_counts() {
        let (engine, _) = engine_with(vec![("post", 1, json!({"post_title": "x"}))]).await;
        let counts = engine.document_counts().await;
        assert_eq!(counts.get("post"), Some(&Some(1)));
        assert_eq!(counts.get("page"), Some(&Some(0)));
    }
}
