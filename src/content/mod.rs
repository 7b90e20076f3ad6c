//! Site content: posts, their meta and taxonomy terms.

pub mod postgres;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

pub use postgres::PgContentStore;

pub const PUBLISHED: &str = "publish";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub post_type: String,
    pub status: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub author: String,
    pub date: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub permalink: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl Post {
    pub fn is_published(&self) -> bool {
        self.status == PUBLISHED
    }
}

/// Taxonomy name -> term names.
pub type Terms = BTreeMap<String, Vec<String>>;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch_post(&self, id: u64) -> anyhow::Result<Option<Post>>;

    /// Published posts of one type, in id order.
    async fn fetch_published(&self, post_type: &str) -> anyhow::Result<Vec<Post>>;

    async fn terms_for(&self, id: u64) -> anyhow::Result<Terms>;

    /// Posts of any status modified after `since`, as `(id, modified)`,
    /// oldest change first.
    async fn modified_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<(u64, DateTime<Utc>)>>;
}

/// Seed-file entry: a post plus its terms.
#[derive(Debug, Deserialize)]
struct SeedPost {
    #[serde(flatten)]
    post: Post,
    #[serde(default)]
    terms: Terms,
}

#[derive(Default)]
struct Inner {
    posts: BTreeMap<u64, Post>,
    terms: HashMap<u64, Terms>,
}

/// In-process content store, optionally seeded from a JSON file.
#[derive(Default)]
pub struct MemoryContentStore {
    inner: RwLock<Inner>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of posts, each optionally carrying a `terms` object.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let seed: Vec<SeedPost> = serde_json::from_str(json).context("invalid content seed")?;
        let mut inner = Inner::default();
        for entry in seed {
            inner.terms.insert(entry.post.id, entry.terms);
            inner.posts.insert(entry.post.id, entry.post);
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read content file {}", path.display()))?;
        Self::from_json(&json)
    }

    pub async fn upsert(&self, post: Post, terms: Terms) {
        let mut inner = self.inner.write().await;
        inner.terms.insert(post.id, terms);
        inner.posts.insert(post.id, post);
    }

    pub async fn remove(&self, id: u64) -> Option<Post> {
        let mut inner = self.inner.write().await;
        inner.terms.remove(&id);
        inner.posts.remove(&id)
    }

    /// Change a post's status (e.g. `trash`, `draft`) and touch its
    /// modification time. Returns false when the post does not exist.
    pub async fn set_status(&self, id: u64, status: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.posts.get_mut(&id) {
            Some(post) => {
                post.status = status.to_string();
                post.modified = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.posts.len()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn fetch_post(&self, id: u64) -> anyhow::Result<Option<Post>> {
        Ok(self.inner.read().await.posts.get(&id).cloned())
    }

    async fn fetch_published(&self, post_type: &str) -> anyhow::Result<Vec<Post>> {
        Ok(self
            .inner
            .read()
            .await
            .posts
            .values()
            .filter(|p| p.post_type == post_type && p.is_published())
            .cloned()
            .collect())
    }

    async fn terms_for(&self, id: u64) -> anyhow::Result<Terms> {
        Ok(self
            .inner
            .read()
            .await
            .terms
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn modified_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<(u64, DateTime<Utc>)>> {
        let mut changed: Vec<(u64, DateTime<Utc>)> = self
            .inner
            .read()
            .await
            .posts
            .values()
            .filter(|p| p.modified > since)
            .map(|p| (p.id, p.modified))
            .collect();
        changed.sort_by_key(|(id, modified)| (*modified, *id));
        Ok(changed)
    }
}
