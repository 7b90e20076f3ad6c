use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;

use super::{ContentStore, Post, Terms, PUBLISHED};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: i64,
    post_type: String,
    status: String,
    title: String,
    content: String,
    excerpt: String,
    author: String,
    date: DateTime<Utc>,
    modified: DateTime<Utc>,
    slug: String,
    permalink: String,
}

/// Content read from Postgres (`posts`, `post_meta`, `post_terms`).
#[derive(Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn meta_for(&self, id: i64) -> anyhow::Result<Map<String, Value>> {
        let rows = sqlx::query_as::<_, (String, Value)>(
            "SELECT meta_key, meta_value FROM post_meta WHERE post_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hydrate(&self, row: PostRow) -> anyhow::Result<Post> {
        let meta = self.meta_for(row.id).await?;
        Ok(Post {
            id: u64::try_from(row.id)?,
            post_type: row.post_type,
            status: row.status,
            title: row.title,
            content: row.content,
            excerpt: row.excerpt,
            author: row.author,
            date: row.date,
            modified: row.modified,
            slug: row.slug,
            permalink: row.permalink,
            meta,
        })
    }
}

const POST_COLUMNS: &str =
    "id, post_type, status, title, content, excerpt, author, date, modified, slug, permalink";

#[async_trait]
impl ContentStore for PgContentStore {
    async fn fetch_post(&self, id: u64) -> anyhow::Result<Option<Post>> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, PostRow>(&format!("SELECT {} FROM posts WHERE id = $1", POST_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn fetch_published(&self, post_type: &str) -> anyhow::Result<Vec<Post>> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {} FROM posts WHERE post_type = $1 AND status = $2 ORDER BY id ASC",
            POST_COLUMNS
        ))
        .bind(post_type)
        .bind(PUBLISHED)
        .fetch_all(&self.pool)
        .await?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            posts.push(self.hydrate(row).await?);
        }
        Ok(posts)
    }

    async fn terms_for(&self, id: u64) -> anyhow::Result<Terms> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(Terms::new());
        };
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT taxonomy, term FROM post_terms WHERE post_id = $1 ORDER BY taxonomy, term",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut terms = Terms::new();
        for (taxonomy, term) in rows {
            terms.entry(taxonomy).or_default().push(term);
        }
        Ok(terms)
    }

    async fn modified_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<(u64, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            "SELECT id, modified FROM posts WHERE modified > $1 ORDER BY modified ASC, id ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, modified)| Ok((u64::try_from(id)?, modified)))
            .collect()
    }
}
