//! Bearer token registry.
//!
//! Raw tokens are handed out once and never stored. Each token is one KV
//! entry under `mcp_token:<hash>`, where the hash is the hex HMAC-SHA256 of
//! the token keyed by the site secret. Issue and revoke only touch their own
//! entry, and validation never writes the record: `last_used` lives under
//! its own key.

use std::collections::BTreeSet;

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::cache::TieredCache;
use crate::errors::{AppError, AuthError};

type HmacSha256 = Hmac<Sha256>;

/// Scopes a token can be granted, with their descriptions.
pub const KNOWN_SCOPES: &[(&str, &str)] = &[
    ("search.read", "Search published content and fetch single posts"),
    ("schema.read", "Read the indexed field schema"),
    ("health.read", "Read service health"),
    ("commands.read", "List available commands"),
    ("index.write", "Push content changes into the search index"),
];

pub const DEFAULT_SCOPE: &str = "search.read";

/// Shortest hash prefix accepted when revoking by prefix.
pub const MIN_HASH_PREFIX: usize = 8;

const HASH_HEX_LEN: usize = 64;

/// Longest lifetime a token can be issued with.
pub const MAX_TTL_HOURS: u64 = 168;

const RECORD_PREFIX: &str = "mcp_token:";
const LAST_USED_PREFIX: &str = "token_last_used:";
const VALIDATION_CACHE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub hash: String,
    pub label: String,
    pub scopes: BTreeSet<String>,
    pub issued_at: i64,
    /// Unix seconds; 0 means the token never expires.
    pub expires_at: i64,
    pub last_used: Option<i64>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && now > self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Seconds of life left at issuance, 0 for tokens that never expire.
    pub fn expires_in(&self) -> i64 {
        if self.expires_at == 0 {
            0
        } else {
            self.expires_at - self.issued_at
        }
    }

    /// Space-separated scope string, OAuth style.
    pub fn scope_string(&self) -> String {
        self.scopes.iter().cloned().collect::<Vec<_>>().join(" ")
    }

    /// Short, non-secret prefix of the hash used in rate-limit identities and logs.
    pub fn fingerprint(&self) -> &str {
        &self.hash[..self.hash.len().min(16)]
    }
}

/// Result of `issue_token`. `access_token` is the only copy of the raw secret.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub hash: String,
    pub record: TokenRecord,
}

/// The OAuth-style JSON returned to clients after issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub scope: String,
}

impl From<&IssuedToken> for TokenResponse {
    fn from(issued: &IssuedToken) -> Self {
        Self {
            access_token: issued.access_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: issued.record.expires_in(),
            scope: issued.record.scope_string(),
        }
    }
}

/// Keep only recognised scopes; fall back to the default scope when nothing
/// survives.
pub fn grant_scopes<S: AsRef<str>>(requested: &[S]) -> BTreeSet<String> {
    let mut granted: BTreeSet<String> = requested
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| KNOWN_SCOPES.iter().any(|(known, _)| known == s))
        .map(String::from)
        .collect();
    if granted.is_empty() {
        granted.insert(DEFAULT_SCOPE.to_string());
    }
    granted
}

pub struct TokenService {
    cache: TieredCache,
    secret: Vec<u8>,
}

impl TokenService {
    pub fn new(cache: TieredCache, site_secret: &str) -> Self {
        Self {
            cache,
            secret: site_secret.as_bytes().to_vec(),
        }
    }

    /// Hex HMAC-SHA256 of a raw token.
    pub fn hash_token(&self, raw: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(raw.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub async fn issue_token<S: AsRef<str>>(
        &self,
        label: &str,
        scopes: &[S],
        ttl_hours: u64,
    ) -> anyhow::Result<IssuedToken> {
        self.issue_token_at(label, scopes, ttl_hours, chrono::Utc::now().timestamp())
            .await
    }

    pub(crate) async fn issue_token_at<S: AsRef<str>>(
        &self,
        label: &str,
        scopes: &[S],
        ttl_hours: u64,
        now: i64,
    ) -> anyhow::Result<IssuedToken> {
        let ttl_hours = ttl_hours.min(MAX_TTL_HOURS);

        let mut random_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut random_bytes);
        let access_token = format!("loupe_{}", hex::encode(random_bytes));
        let hash = self.hash_token(&access_token);

        let record = TokenRecord {
            hash: hash.clone(),
            label: label.to_string(),
            scopes: grant_scopes(scopes),
            issued_at: now,
            expires_at: if ttl_hours == 0 {
                0
            } else {
                now + (ttl_hours as i64) * 3600
            },
            last_used: None,
        };

        self.cache.set(&record_key(&hash), &record, None).await?;

        tracing::info!(
            label = label,
            token = record.fingerprint(),
            scopes = %record.scope_string(),
            expires_at = record.expires_at,
            "issued bearer token"
        );

        Ok(IssuedToken {
            access_token,
            hash,
            record,
        })
    }

    pub async fn validate_bearer(&self, token: &str) -> Result<TokenRecord, AppError> {
        self.validate_at(token, chrono::Utc::now().timestamp()).await
    }

    /// Validate a raw token. A successful check is cached for a short time;
    /// `last_used` is written at most once per cache period.
    pub(crate) async fn validate_at(&self, token: &str, now: i64) -> Result<TokenRecord, AppError> {
        let hash = self.hash_token(token);
        let cache_key = validation_key(&hash);

        if let Some(cached) = self.cache.get_authoritative::<TokenRecord>(&cache_key).await? {
            if cached.hash.as_bytes().ct_eq(hash.as_bytes()).into() {
                if cached.is_expired(now) {
                    self.cache.delete(&cache_key).await?;
                    return Err(AuthError::Expired.into());
                }
                return Ok(cached);
            }
        }

        let mut validated = match self.cache.get_authoritative::<TokenRecord>(&record_key(&hash)).await? {
            Some(r) if bool::from(r.hash.as_bytes().ct_eq(hash.as_bytes())) => r,
            _ => return Err(AuthError::InvalidToken.into()),
        };

        if validated.is_expired(now) {
            return Err(AuthError::Expired.into());
        }

        validated.last_used = Some(now);
        self.cache.set(&last_used_key(&hash), &now, None).await?;

        let ttl = if validated.expires_at == 0 {
            VALIDATION_CACHE_TTL_SECS
        } else {
            // never cache past expiry
            VALIDATION_CACHE_TTL_SECS.min((validated.expires_at - now).max(1) as u64)
        };
        self.cache.set(&cache_key, &validated, Some(ttl)).await?;

        // a revoke that landed between the read and the cache write
        if self
            .cache
            .get_authoritative::<TokenRecord>(&record_key(&hash))
            .await?
            .is_none()
        {
            self.cache.delete(&cache_key).await?;
            return Err(AuthError::InvalidToken.into());
        }

        Ok(validated)
    }

    /// Revoke by full hash or by a unique prefix of at least
    /// `MIN_HASH_PREFIX` characters. Returns whether a token was removed.
    pub async fn revoke_token(&self, hash_or_prefix: &str) -> anyhow::Result<bool> {
        let needle = hash_or_prefix.trim().to_ascii_lowercase();
        let hash = if needle.len() == HASH_HEX_LEN {
            needle
        } else {
            match self.resolve_hash(&needle).await? {
                Some(hash) => hash,
                None => return Ok(false),
            }
        };
        let removed = self
            .cache
            .get_authoritative::<TokenRecord>(&record_key(&hash))
            .await?
            .is_some();
        self.forget(&hash).await?;
        if removed {
            tracing::info!(token = &hash[..hash.len().min(16)], "revoked bearer token");
        }
        Ok(removed)
    }

    pub async fn revoke_all_tokens(&self) -> anyhow::Result<usize> {
        let hashes = self.hashes().await?;
        for hash in &hashes {
            self.forget(hash).await?;
        }
        tracing::info!(count = hashes.len(), "revoked all bearer tokens");
        Ok(hashes.len())
    }

    /// All records, oldest first. Records hold no secrets.
    pub async fn list_tokens(&self) -> anyhow::Result<Vec<TokenRecord>> {
        let mut records = Vec::new();
        for hash in self.hashes().await? {
            // revoked between listing keys and reading them
            let Some(mut record) = self.cache.get_authoritative::<TokenRecord>(&record_key(&hash)).await? else {
                continue;
            };
            record.last_used = self.cache.get_authoritative::<i64>(&last_used_key(&hash)).await?;
            records.push(record);
        }
        records.sort_by_key(|r| r.issued_at);
        Ok(records)
    }

    /// Expand a hash prefix to the one stored hash it names.
    pub async fn resolve_hash(&self, hash_or_prefix: &str) -> anyhow::Result<Option<String>> {
        let needle = hash_or_prefix.trim().to_ascii_lowercase();
        if needle.len() < MIN_HASH_PREFIX {
            anyhow::bail!("token hash prefix must be at least {} characters", MIN_HASH_PREFIX);
        }
        let mut matches: Vec<String> = self
            .hashes()
            .await?
            .into_iter()
            .filter(|h| h.starts_with(&needle))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => anyhow::bail!("token hash prefix '{}' matches {} tokens", needle, n),
        }
    }

    async fn hashes(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .cache
            .keys_with_prefix(RECORD_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(RECORD_PREFIX).map(String::from))
            .collect())
    }

    async fn forget(&self, hash: &str) -> anyhow::Result<()> {
        self.cache.delete(&record_key(hash)).await?;
        self.cache.delete(&last_used_key(hash)).await?;
        self.cache.delete(&validation_key(hash)).await
    }
}

fn record_key(hash: &str) -> String {
    format!("{}{}", RECORD_PREFIX, hash)
}

fn last_used_key(hash: &str) -> String {
    format!("{}{}", LAST_USED_PREFIX, hash)
}

fn validation_key(hash: &str) -> String {
    format!("token_valid:{}", hash)
}
