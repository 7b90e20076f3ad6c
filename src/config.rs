use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use url::Url;

const PLACEHOLDER_SECRET: &str = "CHANGE_ME_SITE_SECRET";

/// One fixed-window policy: at most `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub window_secs: u64,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub anonymous: WindowPolicy,
    pub authenticated: WindowPolicy,
    /// Search sub-limit for anonymous callers (same window as `anonymous`).
    pub max_search_anon: u32,
    /// Search sub-limit for token holders (same window as `authenticated`).
    pub max_search_auth: u32,
    /// `/oauth/token` requests per IP (same window as `anonymous`).
    pub max_token_requests: u32,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Hits fetched from the index per post type before merging.
    pub max_results_per_type: usize,
    pub cache_ttl_secs: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Public origin of this server, used for discovery documents.
    pub base_url: Url,
    pub server_name: String,
    /// Key for token hashes and cursor signatures.
    pub site_secret: String,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    /// JSON file with posts to serve when no database is configured.
    pub content_file: Option<PathBuf>,
    /// YAML file describing per-post-type fields.
    pub schema_file: Option<PathBuf>,
    /// Reject anonymous `/commands` calls.
    pub require_auth: bool,
    /// Take the client IP from `X-Forwarded-For` (behind a trusted proxy).
    pub trust_forwarded_for: bool,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub rate_limits: RateLimitConfig,
    pub search: SearchConfig,
    /// Seconds between incremental index syncs; 0 disables the job.
    pub sync_interval_secs: u64,
}

impl Config {
    /// `/.well-known/oauth-protected-resource` under the public origin.
    pub fn resource_metadata_url(&self) -> String {
        self.endpoint(".well-known/oauth-protected-resource")
    }

    pub fn commands_url(&self) -> String {
        self.endpoint("commands")
    }

    pub fn endpoint(&self, path: &str) -> String {
        self.base_url
            .join(path)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path))
    }

    /// Build a config from an arbitrary variable source.
    ///
    /// Values that are present but unparseable are rejected; numeric limits
    /// are clamped to their allowed ranges.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site_secret = lookup("LOUPE_SITE_SECRET").unwrap_or_else(|| PLACEHOLDER_SECRET.into());
        if site_secret == PLACEHOLDER_SECRET {
            let env_mode = lookup("LOUPE_ENV").or_else(|| lookup("RUST_ENV")).unwrap_or_default();
            if env_mode == "production" {
                anyhow::bail!(
                    "LOUPE_SITE_SECRET is still the insecure placeholder. \
                     Set a long random secret before running in production."
                );
            }
            tracing::warn!("LOUPE_SITE_SECRET is not set; using insecure placeholder");
        } else if site_secret.len() < 32 {
            tracing::warn!("LOUPE_SITE_SECRET is shorter than 32 characters");
        }

        let port: u16 = parse_var(&lookup, "LOUPE_PORT", 8787)?;
        let base_url_raw = lookup("LOUPE_BASE_URL").unwrap_or_else(|| format!("http://localhost:{}/", port));
        let mut base_url = Url::parse(&base_url_raw)
            .with_context(|| format!("LOUPE_BASE_URL is not a valid URL: {}", base_url_raw))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let anonymous = WindowPolicy {
            window_secs: parse_var(&lookup, "LOUPE_RATE_ANON_WINDOW", 60u64)?.clamp(10, 3600),
            limit: parse_var(&lookup, "LOUPE_RATE_ANON_LIMIT", 60u32)?.clamp(1, 1000),
        };
        let mut authenticated = WindowPolicy {
            window_secs: parse_var(&lookup, "LOUPE_RATE_AUTH_WINDOW", 60u64)?.clamp(10, 3600),
            limit: parse_var(&lookup, "LOUPE_RATE_AUTH_LIMIT", 300u32)?.clamp(1, 5000),
        };
        if authenticated.limit <= anonymous.limit {
            let raised = (anonymous.limit + 1).min(5000);
            tracing::warn!(
                anonymous = anonymous.limit,
                authenticated = authenticated.limit,
                "authenticated rate limit must exceed the anonymous one; raising to {}",
                raised
            );
            authenticated.limit = raised;
        }
        let max_search_anon =
            parse_var(&lookup, "LOUPE_MAX_SEARCH_ANON", 30u32)?.clamp(1, anonymous.limit);
        let max_search_auth =
            parse_var(&lookup, "LOUPE_MAX_SEARCH_AUTH", 120u32)?.clamp(1, authenticated.limit);

        let max_token_requests = parse_var(&lookup, "LOUPE_RATE_TOKEN_LIMIT", 10u32)?.clamp(1, 100);

        let max_page_size = parse_var(&lookup, "LOUPE_MAX_PAGE_SIZE", 100usize)?.clamp(1, 100);
        let search = SearchConfig {
            max_results_per_type: parse_var(&lookup, "LOUPE_MAX_RESULTS_PER_TYPE", 200usize)?.clamp(1, 1000),
            cache_ttl_secs: parse_var(&lookup, "LOUPE_SEARCH_CACHE_TTL", 3600u64)?,
            default_page_size: parse_var(&lookup, "LOUPE_DEFAULT_PAGE_SIZE", 10usize)?.clamp(1, max_page_size),
            max_page_size,
        };

        Ok(Config {
            port,
            base_url,
            server_name: lookup("LOUPE_SERVER_NAME").unwrap_or_else(|| "Loupe Search".into()),
            site_secret,
            redis_url: lookup("REDIS_URL").filter(|s| !s.is_empty()),
            database_url: lookup("DATABASE_URL").filter(|s| !s.is_empty()),
            content_file: lookup("LOUPE_CONTENT_FILE").map(PathBuf::from),
            schema_file: lookup("LOUPE_SCHEMA_FILE").map(PathBuf::from),
            require_auth: parse_bool(&lookup, "LOUPE_REQUIRE_AUTH", false)?,
            trust_forwarded_for: parse_bool(&lookup, "LOUPE_TRUST_FORWARDED_FOR", false)?,
            client_id: lookup("LOUPE_CLIENT_ID").unwrap_or_else(|| "loupe-mcp".into()),
            client_secret: lookup("LOUPE_CLIENT_SECRET").filter(|s| !s.is_empty()),
            rate_limits: RateLimitConfig {
                anonymous,
                authenticated,
                max_search_anon,
                max_search_auth,
                max_token_requests,
            },
            search,
            sync_interval_secs: parse_var(&lookup, "LOUPE_SYNC_INTERVAL", 60u64)?.min(3600),
        })
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", name, raw, e)),
    }
}

fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> anyhow::Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => anyhow::bail!("{} must be a boolean, got '{}'", name, v),
        },
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config_with(&[]).unwrap();
        assert_eq!(cfg.port, 8787);
        assert_eq!(cfg.rate_limits.anonymous, WindowPolicy { window_secs: 60, limit: 60 });
        assert!(cfg.rate_limits.authenticated.limit > cfg.rate_limits.anonymous.limit);
        assert_eq!(cfg.search.default_page_size, 10);
        assert!(!cfg.require_auth);
        assert!(cfg.client_secret.is_none());
        assert_eq!(cfg.sync_interval_secs, 60);
        assert_eq!(config_with(&[("LOUPE_SYNC_INTERVAL", "0")]).unwrap().sync_interval_secs, 0);
    }

    #[test]
    fn test_bounds_are_clamped() {
        let cfg = config_with(&[
            ("LOUPE_RATE_ANON_WINDOW", "1"),
            ("LOUPE_RATE_ANON_LIMIT", "99999"),
            ("LOUPE_RATE_AUTH_WINDOW", "86400"),
            ("LOUPE_RATE_AUTH_LIMIT", "99999"),
        ])
        .unwrap();
        assert_eq!(cfg.rate_limits.anonymous.window_secs, 10);
        assert_eq!(cfg.rate_limits.anonymous.limit, 1000);
        assert_eq!(cfg.rate_limits.authenticated.window_secs, 3600);
        assert_eq!(cfg.rate_limits.authenticated.limit, 5000);
    }

    #[test]
    fn test_authenticated_ceiling_raised_above_anonymous() {
        let cfg = config_with(&[("LOUPE_RATE_ANON_LIMIT", "100"), ("LOUPE_RATE_AUTH_LIMIT", "50")]).unwrap();
        assert_eq!(cfg.rate_limits.authenticated.limit, 101);
    }

    #[test]
    fn test_invalid_values_fail_fast() {
        assert!(config_with(&[("LOUPE_PORT", "eighty")]).is_err());
        assert!(config_with(&[("LOUPE_REQUIRE_AUTH", "maybe")]).is_err());
        assert!(config_with(&[("LOUPE_BASE_URL", "not a url")]).is_err());
    }

    #[test]
    fn test_placeholder_secret_rejected_in_production() {
        assert!(config_with(&[("LOUPE_ENV", "production")]).is_err());
        assert!(config_with(&[
            ("LOUPE_ENV", "production"),
            ("LOUPE_SITE_SECRET", "0123456789abcdef0123456789abcdef"),
        ])
        .is_ok());
    }

    #[test]
    fn test_discovery_urls() {
        let cfg = config_with(&[("LOUPE_BASE_URL", "https://search.example.com/mcp")]).unwrap();
        assert_eq!(
            cfg.resource_metadata_url(),
            "https://search.example.com/mcp/.well-known/oauth-protected-resource"
        );
        assert_eq!(cfg.commands_url(), "https://search.example.com/mcp/commands");
    }
}
