//! Loupe MCP gateway: bearer-authenticated, rate-limited full-text search
//! over published site content.
//!
//! The binary in `main.rs` wires these modules to a listener and a CLI;
//! integration tests in `tests/` drive the router directly.

pub mod api;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod content;
pub mod errors;
pub mod jobs;
pub mod mcp;
pub mod middleware;
pub mod search;

use std::sync::Arc;

use anyhow::Context;

use auth::TokenService;
use cache::TieredCache;
use config::Config;
use content::{ContentStore, MemoryContentStore, PgContentStore};
use middleware::metrics::Metrics;
use middleware::rate_limit::RateLimiter;
use search::{CursorCodec, DefaultSortablePolicy, Indexer, MemoryIndex, Schema, SearchEngine, SearchIndex};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: Config,
    pub cache: TieredCache,
    pub tokens: TokenService,
    pub limiter: RateLimiter,
    pub cursors: CursorCodec,
    pub content: Arc<dyn ContentStore>,
    pub engine: Arc<SearchEngine>,
    pub indexer: Indexer,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: TieredCache,
        content: Arc<dyn ContentStore>,
        index: Arc<dyn SearchIndex>,
        schema: Schema,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let engine = Arc::new(
            SearchEngine::new(index, Arc::new(schema), cache.clone(), config.search.clone())
                .with_metrics(metrics.clone()),
        );

        Ok(Self {
            tokens: TokenService::new(cache.clone(), &config.site_secret),
            limiter: RateLimiter::new(cache.clone(), config.rate_limits.clone()),
            cursors: CursorCodec::new(&config.site_secret),
            indexer: Indexer::new(content.clone(), engine.clone()),
            content,
            engine,
            metrics,
            cache,
            config,
        })
    }

    /// Everything in memory: default schema, empty index, given content.
    pub fn in_memory(config: Config, content: Arc<dyn ContentStore>) -> anyhow::Result<Self> {
        Self::new(
            config,
            TieredCache::in_memory(),
            content,
            Arc::new(MemoryIndex::new()),
            Schema::default_schema(),
        )
    }

    /// Build state from configuration: Redis when `REDIS_URL` is set,
    /// Postgres or a JSON seed file for content, YAML or built-in schema.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let cache = match &config.redis_url {
            Some(url) => {
                tracing::info!("Connecting to Redis...");
                let client = redis::Client::open(url.as_str()).context("invalid REDIS_URL")?;
                let conn = redis::aio::ConnectionManager::new(client).await?;
                TieredCache::with_redis(conn)
            }
            None => {
                tracing::info!("REDIS_URL not set; tokens and counters are kept in process memory");
                TieredCache::in_memory()
            }
        };

        let content: Arc<dyn ContentStore> = if let Some(url) = &config.database_url {
            tracing::info!("Connecting to database...");
            let store = PgContentStore::connect(url).await?;
            tracing::info!("Running migrations...");
            store.migrate().await?;
            Arc::new(store)
        } else if let Some(path) = &config.content_file {
            tracing::info!(path = %path.display(), "Loading content seed file");
            Arc::new(MemoryContentStore::from_json_file(path)?)
        } else {
            tracing::warn!("no DATABASE_URL or LOUPE_CONTENT_FILE; serving an empty site");
            Arc::new(MemoryContentStore::new())
        };

        let schema = match &config.schema_file {
            Some(path) => Schema::from_file(path, &DefaultSortablePolicy)?,
            None => Schema::default_schema(),
        };

        Self::new(config, cache, content, Arc::new(MemoryIndex::new()), schema)
    }
}
