//! Keeps the index in step with the content store.
//!
//! Every change invalidates the search result cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::engine::{collection_settings, SearchEngine};
use super::index::Document;
use super::schema::PostTypeSchema;
use crate::content::{ContentStore, Post, Terms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    Removed,
    /// Post type is not configured for search.
    Skipped,
}

impl IndexOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexOutcome::Indexed => "indexed",
            IndexOutcome::Removed => "removed",
            IndexOutcome::Skipped => "skipped",
        }
    }
}

/// Flatten a post into the document stored for its post type.
pub fn document_for(post: &Post, terms: &Terms, schema: &PostTypeSchema) -> Document {
    let mut fields = Map::new();
    fields.insert("post_type".into(), Value::from(post.post_type.clone()));
    fields.insert("post_title".into(), Value::from(post.title.clone()));
    fields.insert("post_content".into(), Value::from(post.content.clone()));
    fields.insert("post_excerpt".into(), Value::from(post.excerpt.clone()));
    fields.insert("post_date".into(), Value::from(post.date.to_rfc3339()));
    fields.insert("post_modified".into(), Value::from(post.modified.to_rfc3339()));
    fields.insert("post_author".into(), Value::from(post.author.clone()));
    fields.insert("post_name".into(), Value::from(post.slug.clone()));
    fields.insert("permalink".into(), Value::from(post.permalink.clone()));

    for (taxonomy, names) in terms {
        fields.insert(format!("taxonomy_{}", taxonomy), Value::from(names.clone()));
    }

    // meta only when the schema asks for it
    for name in schema.fields.keys() {
        if fields.contains_key(name) {
            continue;
        }
        if let Some(value) = post.meta.get(name) {
            fields.insert(name.clone(), value.clone());
        }
    }

    Document { id: post.id, fields }
}

pub struct Indexer {
    content: Arc<dyn ContentStore>,
    engine: Arc<SearchEngine>,
}

impl Indexer {
    pub fn new(content: Arc<dyn ContentStore>, engine: Arc<SearchEngine>) -> Self {
        Self { content, engine }
    }

    /// Index a post after it was created or updated. Unpublished posts are
    /// removed from the index; missing posts are removed everywhere.
    pub async fn index_post(&self, id: u64) -> anyhow::Result<IndexOutcome> {
        let outcome = self.index_post_inner(id).await;
        self.engine.invalidate_cache().await?;
        outcome
    }

    async fn index_post_inner(&self, id: u64) -> anyhow::Result<IndexOutcome> {
        let Some(post) = self.content.fetch_post(id).await? else {
            self.remove_everywhere(id).await?;
            return Ok(IndexOutcome::Removed);
        };
        let Some(schema) = self.engine.schema().get(&post.post_type) else {
            return Ok(IndexOutcome::Skipped);
        };

        let index = self.engine.index();
        index
            .ensure_index(&schema.name, collection_settings(schema))
            .await?;

        if !post.is_published() {
            index.delete_document(&post.post_type, id).await?;
            tracing::debug!(post_id = id, status = %post.status, "removed unpublished post from index");
            return Ok(IndexOutcome::Removed);
        }

        let terms = self.content.terms_for(id).await?;
        index
            .add_documents(&post.post_type, vec![document_for(&post, &terms, schema)])
            .await?;
        tracing::debug!(post_id = id, post_type = %post.post_type, "indexed post");
        Ok(IndexOutcome::Indexed)
    }

    /// Returns whether a document was removed.
    pub async fn delete_post(&self, post_type: &str, id: u64) -> anyhow::Result<bool> {
        let removed = if self.engine.schema().contains(post_type) {
            self.engine.index().delete_document(post_type, id).await?
        } else {
            false
        };
        self.engine.invalidate_cache().await?;
        Ok(removed)
    }

    /// Remove a trashed post from whichever collection holds it.
    pub async fn trash_post(&self, id: u64) -> anyhow::Result<bool> {
        let removed = match self.content.fetch_post(id).await? {
            Some(post) if self.engine.schema().contains(&post.post_type) => {
                self.engine.index().delete_document(&post.post_type, id).await?
            }
            Some(_) => false,
            None => self.remove_everywhere(id).await?,
        };
        self.engine.invalidate_cache().await?;
        Ok(removed)
    }

    /// Rebuild every configured collection from published content.
    /// Returns the number of documents indexed per post type.
    pub async fn reindex_all(&self) -> anyhow::Result<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        let index = self.engine.index();

        for schema in self.engine.schema().post_types() {
            index
                .create_index(&schema.name, collection_settings(schema))
                .await?;

            let posts = self.content.fetch_published(&schema.name).await?;
            let mut documents = Vec::with_capacity(posts.len());
            for post in &posts {
                let terms = self.content.terms_for(post.id).await?;
                documents.push(document_for(post, &terms, schema));
            }
            let count = documents.len();
            index.add_documents(&schema.name, documents).await?;

            tracing::info!(post_type = %schema.name, documents = count, "reindexed collection");
            counts.insert(schema.name.clone(), count);
        }

        self.engine.invalidate_cache().await?;
        Ok(counts)
    }

    async fn remove_everywhere(&self, id: u64) -> anyhow::Result<bool> {
        let mut removed = false;
        for name in self.engine.schema().names() {
            match self.engine.index().delete_document(&name, id).await {
                Ok(r) => removed |= r,
                Err(e) => tracing::debug!(post_type = %name, error = %e, "skip delete"),
            }
        }
        Ok(removed)
    }
}
