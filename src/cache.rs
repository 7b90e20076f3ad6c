use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a Redis-backed value may live in the local tier.
const LOCAL_TTL_CAP_SECS: u64 = 30;

/// Entry stored in the local DashMap with an optional expiry.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl_secs: Option<u64>) -> Self {
        Self {
            value,
            expires_at: ttl_secs.map(|s| Instant::now() + Duration::from_secs(s)),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now < t).unwrap_or(true)
    }
}

/// Key-value store shared by tokens, rate-limit windows, search results and
/// discovery documents.
///
/// Tier 1 is an in-memory DashMap; tier 2 is Redis when `REDIS_URL` is set.
/// Without Redis the local tier is the store of record. Values are JSON.
///
/// `get` may answer from the local tier. `get_authoritative` always asks
/// the store of record and is what token and rate-limit checks use, so a
/// revocation in another process is seen immediately.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn in_memory() -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            redis: None,
        }
    }

    pub fn with_redis(redis: ConnectionManager) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            redis: Some(redis),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.redis.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if entry.is_live(Instant::now()) {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired: drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(v)) => {
                let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(-1);
                let local_ttl = if ttl_secs > 0 {
                    (ttl_secs as u64).min(LOCAL_TTL_CAP_SECS)
                } else {
                    LOCAL_TTL_CAP_SECS
                };
                self.local
                    .insert(key.to_string(), CacheEntry::new(v.clone(), Some(local_ttl)));
                serde_json::from_str(&v).ok()
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = key, "redis get failed: {}", e);
                None
            }
        }
    }

    /// Read straight from the store of record, skipping the local copy of
    /// Redis-backed values.
    pub async fn get_authoritative<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        let Some(mut conn) = self.redis.clone() else {
            let now = Instant::now();
            let value = match self.local.get(key) {
                Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
                Some(entry) => {
                    drop(entry);
                    self.local.remove(key);
                    None
                }
                None => None,
            };
            return Ok(match value {
                Some(v) => Some(serde_json::from_str(&v)?),
                None => None,
            });
        };

        let raw: Option<String> = conn.get(key).await?;
        Ok(match raw {
            Some(v) => Some(serde_json::from_str(&v)?),
            None => None,
        })
    }

    /// Store a value. `ttl_secs = None` keeps it until deleted.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;

        if let Some(mut conn) = self.redis.clone() {
            match ttl_secs {
                Some(ttl) => conn.set_ex::<_, _, ()>(key, &json, ttl.max(1)).await?,
                None => conn.set::<_, _, ()>(key, &json).await?,
            }
            let local_ttl = ttl_secs.unwrap_or(LOCAL_TTL_CAP_SECS).min(LOCAL_TTL_CAP_SECS);
            self.local
                .insert(key.to_string(), CacheEntry::new(json, Some(local_ttl)));
        } else {
            self.local
                .insert(key.to_string(), CacheEntry::new(json, ttl_secs));
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.local.remove(key);
        if let Some(mut conn) = self.redis.clone() {
            conn.del::<_, ()>(key).await?;
        }
        Ok(())
    }

    /// Keys under `prefix` in the store of record.
    pub async fn keys_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let Some(mut conn) = self.redis.clone() else {
            let now = Instant::now();
            let mut keys: Vec<String> = self
                .local
                .iter()
                .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
                .map(|entry| entry.key().clone())
                .collect();
            keys.sort();
            return Ok(keys);
        };

        let mut keys: Vec<String> = conn.keys(format!("{}*", prefix)).await?;
        keys.sort();
        Ok(keys)
    }

    /// Remove all locally-expired entries.  Call this periodically from a
    /// background task (e.g. every 60 s) to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len();
        self.local.retain(|_, entry| entry.is_live(now));
        before - self.local.len()
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = TieredCache::in_memory();
        cache.set("k", &vec![1, 2, 3], None).await.unwrap();
        assert_eq!(cache.get::<Vec<i32>>("k").await, Some(vec![1, 2, 3]));
        assert_eq!(
            cache.get_authoritative::<Vec<i32>>("k").await.unwrap(),
            Some(vec![1, 2, 3])
        );

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get::<Vec<i32>>("k").await, None);
        assert!(!cache.is_persistent());
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_served() {
        let cache = TieredCache::in_memory();
        cache.local.insert(
            "stale".into(),
            CacheEntry {
                value: "1".into(),
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );
        cache.set("fresh", &1, Some(60)).await.unwrap();

        assert_eq!(cache.get::<i32>("stale").await, None);
        assert_eq!(cache.get_authoritative::<i32>("stale").await.unwrap(), None);
        assert_eq!(cache.get::<i32>("fresh").await, Some(1));
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let cache = TieredCache::in_memory();
        cache.local.insert(
            "old".into(),
            CacheEntry {
                value: "1".into(),
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );
        cache.set("keep", &1, None).await.unwrap();
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.local_len(), 1);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let cache = TieredCache::in_memory();
        cache.set("tok:b", &1, None).await.unwrap();
        cache.set("tok:a", &2, None).await.unwrap();
        cache.set("other", &3, None).await.unwrap();
        cache.local.insert(
            "tok:gone".into(),
            CacheEntry {
                value: "1".into(),
                expires_at: Some(Instant::now() - Duration::from_secs(1)),
            },
        );
        assert_eq!(cache.keys_with_prefix("tok:").await.unwrap(), vec!["tok:a", "tok:b"]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error_for_authoritative_reads() {
        let cache = TieredCache::in_memory();
        cache.set("k", &"text", None).await.unwrap();
        assert!(cache.get_authoritative::<u64>("k").await.is_err());
        assert_eq!(cache.get::<u64>("k").await, None);
    }
}
