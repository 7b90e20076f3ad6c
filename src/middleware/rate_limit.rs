use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::TieredCache;
use crate::config::{RateLimitConfig, WindowPolicy};
use crate::errors::AppError;

/// Counter state for one identity in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: i64,
}

/// Independent counters. `Search` carries the stricter search sub-limits;
/// `Token` guards `/oauth/token` so issuance and commands never share a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Commands,
    Search,
    Token,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Commands => "commands",
            Bucket::Search => "search",
            Bucket::Token => "token",
        }
    }
}

/// Advance a window by one request.
///
/// Returns the new window and, when the request is over the limit, the
/// seconds until the window resets. The count keeps increasing past the
/// limit: once tripped, a caller stays blocked until the window expires.
pub fn step(previous: Option<RateWindow>, policy: WindowPolicy, now: i64) -> (RateWindow, Option<u64>) {
    let window = policy.window_secs as i64;
    let next = match previous {
        Some(w) if now - w.window_start <= window => RateWindow {
            count: w.count.saturating_add(1),
            window_start: w.window_start,
        },
        _ => RateWindow {
            count: 1,
            window_start: now,
        },
    };

    if next.count > policy.limit {
        let remaining = window - (now - next.window_start);
        (next, Some(remaining.max(1) as u64))
    } else {
        (next, None)
    }
}

/// Fixed-window limiter keyed by hash(IP, token fingerprint).
///
/// Windows live in the shared KV store with a TTL equal to the window, so
/// concurrent requests race last-writer-wins; a few requests of slack under
/// contention is accepted.
pub struct RateLimiter {
    cache: TieredCache,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: TieredCache, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    pub fn identity(ip: &str, token_fingerprint: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(ip.as_bytes());
        hasher.update(b"|");
        hasher.update(token_fingerprint.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn policy(&self, bucket: Bucket, authenticated: bool) -> WindowPolicy {
        let base = if authenticated {
            self.config.authenticated
        } else {
            self.config.anonymous
        };
        match bucket {
            Bucket::Commands => base,
            Bucket::Search => WindowPolicy {
                window_secs: base.window_secs,
                limit: if authenticated {
                    self.config.max_search_auth
                } else {
                    self.config.max_search_anon
                },
            },
            Bucket::Token => WindowPolicy {
                window_secs: self.config.anonymous.window_secs,
                limit: self.config.max_token_requests,
            },
        }
    }

    pub async fn enforce(&self, bucket: Bucket, identity: &str, authenticated: bool) -> Result<(), AppError> {
        self.enforce_at(bucket, identity, authenticated, chrono::Utc::now().timestamp())
            .await
    }

    pub(crate) async fn enforce_at(
        &self,
        bucket: Bucket,
        identity: &str,
        authenticated: bool,
        now: i64,
    ) -> Result<(), AppError> {
        let policy = self.policy(bucket, authenticated);
        let key = format!("rl:{}:{}", bucket.as_str(), identity);

        let previous = self
            .cache
            .get_authoritative::<RateWindow>(&key)
            .await
            .map_err(AppError::Internal)?;
        let (window, exceeded) = step(previous, policy, now);

        self.cache
            .set(&key, &window, Some(policy.window_secs))
            .await
            .map_err(AppError::Internal)?;

        match exceeded {
            Some(retry_after) => {
                tracing::warn!(
                    rate_limit = true,
                    bucket = bucket.as_str(),
                    identity = &identity[..identity.len().min(12)],
                    authenticated = authenticated,
                    limit = policy.limit,
                    count = window.count,
                    "rate limit exceeded"
                );
                Err(AppError::RateLimited { retry_after })
            }
            None => Ok(()),
        }
    }
}
