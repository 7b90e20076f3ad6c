//! Full-text index abstraction and the in-process implementation.
//!
//! Each post type gets its own collection. The `SearchIndex` trait is the
//! seam where an external engine plugs in; `MemoryIndex` is a compact
//! term-matching index good enough for a single site's content.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::schema::SortDirection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSettings {
    /// Searchable attributes with their weights.
    pub searchable: Vec<(String, f32)>,
    pub filterable: Vec<String>,
    pub sortable: Vec<String>,
}

/// Any-of equality filter on one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub values: Vec<Value>,
}

impl FieldFilter {
    /// A document value matches when it equals one of the filter values, or,
    /// for list values, when any element does.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        match fields.get(&self.field) {
            Some(Value::Array(items)) => items.iter().any(|item| self.values.contains(item)),
            Some(v) => self.values.contains(v),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    pub text: String,
    /// Attributes to search and their weights; empty means the collection's
    /// searchable attributes.
    pub fields: Vec<(String, f32)>,
    pub filters: Vec<FieldFilter>,
    /// Tie-breakers applied after relevance.
    pub sort: Vec<(String, SortDirection)>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: u64,
    pub score: f64,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("index '{0}' does not exist")]
    MissingIndex(String),

    #[error("attribute '{attribute}' is not sortable in index '{index}'")]
    NotSortable { index: String, attribute: String },

    #[error("attribute '{attribute}' is not filterable in index '{index}'")]
    NotFilterable { index: String, attribute: String },
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create an empty collection, dropping any existing one of that name.
    async fn create_index(&self, name: &str, settings: CollectionSettings) -> Result<(), IndexError>;

    /// Open a collection, creating it if needed, and apply `settings`.
    async fn ensure_index(&self, name: &str, settings: CollectionSettings) -> Result<(), IndexError>;

    /// Insert or replace documents by id.
    async fn add_documents(&self, name: &str, documents: Vec<Document>) -> Result<(), IndexError>;

    /// Returns whether a document was removed.
    async fn delete_document(&self, name: &str, id: u64) -> Result<bool, IndexError>;

    async fn search(&self, name: &str, query: &IndexQuery) -> Result<Vec<IndexHit>, IndexError>;

    async fn document_count(&self, name: &str) -> Result<usize, IndexError>;
}

struct Collection {
    settings: CollectionSettings,
    documents: BTreeMap<u64, Document>,
}

#[derive(Default)]
pub struct MemoryIndex {
    collections: DashMap<String, Collection>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lowercased alphanumeric words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(" "),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Exact word matches score 1, prefix matches (query words of 3+ chars)
/// score 0.5, each multiplied by the attribute weight.
fn score_document(doc: &Document, terms: &[String], fields: &[(String, f32)]) -> f64 {
    let mut score = 0.0;
    for (field, weight) in fields {
        let Some(value) = doc.fields.get(field) else {
            continue;
        };
        let words = tokenize(&value_text(value));
        for term in terms {
            for word in &words {
                if word == term {
                    score += *weight as f64;
                } else if term.chars().count() >= 3 && word.starts_with(term.as_str()) {
                    score += *weight as f64 * 0.5;
                }
            }
        }
    }
    score
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        // missing values sort last
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn create_index(&self, name: &str, settings: CollectionSettings) -> Result<(), IndexError> {
        self.collections.insert(
            name.to_string(),
            Collection {
                settings,
                documents: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn ensure_index(&self, name: &str, settings: CollectionSettings) -> Result<(), IndexError> {
        match self.collections.entry(name.to_string()) {
            Entry::Occupied(mut existing) => existing.get_mut().settings = settings,
            Entry::Vacant(slot) => {
                slot.insert(Collection {
                    settings,
                    documents: BTreeMap::new(),
                });
            }
        }
        Ok(())
    }

    async fn add_documents(&self, name: &str, documents: Vec<Document>) -> Result<(), IndexError> {
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| IndexError::MissingIndex(name.to_string()))?;
        for doc in documents {
            collection.documents.insert(doc.id, doc);
        }
        Ok(())
    }

    async fn delete_document(&self, name: &str, id: u64) -> Result<bool, IndexError> {
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| IndexError::MissingIndex(name.to_string()))?;
        Ok(collection.documents.remove(&id).is_some())
    }

    async fn search(&self, name: &str, query: &IndexQuery) -> Result<Vec<IndexHit>, IndexError> {
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| IndexError::MissingIndex(name.to_string()))?;
        let settings = &collection.settings;

        for (attribute, _) in &query.sort {
            if !settings.sortable.contains(attribute) {
                return Err(IndexError::NotSortable {
                    index: name.to_string(),
                    attribute: attribute.clone(),
                });
            }
        }
        for filter in &query.filters {
            if !settings.filterable.contains(&filter.field) {
                return Err(IndexError::NotFilterable {
                    index: name.to_string(),
                    attribute: filter.field.clone(),
                });
            }
        }

        let terms = tokenize(&query.text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let fields = if query.fields.is_empty() {
            &settings.searchable
        } else {
            &query.fields
        };

        let mut hits: Vec<IndexHit> = collection
            .documents
            .values()
            .filter(|doc| query.filters.iter().all(|f| f.matches(&doc.fields)))
            .filter_map(|doc| {
                let score = score_document(doc, &terms, fields);
                (score > 0.0).then(|| IndexHit {
                    id: doc.id,
                    score,
                    fields: doc.fields.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            let mut ord = b.score.total_cmp(&a.score);
            for (attribute, direction) in &query.sort {
                if ord != Ordering::Equal {
                    break;
                }
                let by_value = compare_values(a.fields.get(attribute), b.fields.get(attribute));
                ord = match direction {
                    SortDirection::Asc => by_value,
                    SortDirection::Desc => by_value.reverse(),
                };
            }
            ord
        });

        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        Ok(hits.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn document_count(&self, name: &str) -> Result<usize, IndexError> {
        self.collections
            .get(name)
            .map(|c| c.documents.len())
            .ok_or_else(|| IndexError::MissingIndex(name.to_string()))
    }
}
