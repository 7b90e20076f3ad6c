use axum::http::{header::AUTHORIZATION, HeaderMap};
use subtle::ConstantTimeEq;

use super::tokens::{TokenRecord, TokenService};
use crate::config::Config;
use crate::errors::{AppError, AuthError};
use crate::middleware::rate_limit::RateLimiter;

/// Extract the token from `Authorization: Bearer <token>`.
///
/// `Ok(None)` when the header is absent; `InvalidHeader` for anything that
/// is not a bearer credential with a non-empty token.
pub fn parse_authorization(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::InvalidHeader)?.trim();

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::InvalidHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidHeader);
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(AuthError::InvalidHeader);
    }
    Ok(Some(token))
}

/// Resolve the caller's token, if any.
///
/// A missing header is only an error when `require_auth` is set; a header
/// that is present must always carry a valid token.
pub async fn authenticate(
    tokens: &TokenService,
    headers: &HeaderMap,
    require_auth: bool,
) -> Result<Option<TokenRecord>, AppError> {
    match parse_authorization(headers)? {
        Some(token) => tokens.validate_bearer(token).await.map(Some),
        None if require_auth => Err(AuthError::MissingToken.into()),
        None => Ok(None),
    }
}

/// Who is calling: remote address plus the validated token, if any.
#[derive(Debug, Clone)]
pub struct Caller {
    pub ip: String,
    pub token: Option<TokenRecord>,
}

impl Caller {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            token: None,
        }
    }

    pub fn new(ip: impl Into<String>, token: Option<TokenRecord>) -> Self {
        Self {
            ip: ip.into(),
            token,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Rate-limit identity: hash of (IP, token fingerprint-or-empty).
    pub fn identity(&self) -> String {
        RateLimiter::identity(&self.ip, self.token.as_ref().map(|t| t.fingerprint()))
    }

    /// Token holders must carry `scope`; anonymous callers only ever see
    /// public content and pass.
    pub fn require_scope(&self, scope: &str) -> Result<(), AppError> {
        match &self.token {
            Some(t) if !t.has_scope(scope) => Err(AppError::InsufficientScope(scope.to_string())),
            _ => Ok(()),
        }
    }
}

/// Check client credentials for token issuance.
///
/// Over HTTP a secret must be configured; the CLI passes
/// `allow_unconfigured = true` so a local operator can issue tokens on a
/// server without client credentials.
pub fn verify_client(
    config: &Config,
    client_id: Option<&str>,
    client_secret: Option<&str>,
    allow_unconfigured: bool,
) -> Result<(), AppError> {
    let Some(expected_secret) = config.client_secret.as_deref() else {
        return if allow_unconfigured {
            Ok(())
        } else {
            Err(AppError::InvalidClient)
        };
    };

    let id_ok: bool = client_id
        .unwrap_or_default()
        .as_bytes()
        .ct_eq(config.client_id.as_bytes())
        .into();
    let secret_ok: bool = client_secret
        .unwrap_or_default()
        .as_bytes()
        .ct_eq(expected_secret.as_bytes())
        .into();

    if id_ok && secret_ok {
        Ok(())
    } else {
        tracing::warn!(client_id = client_id.unwrap_or(""), "rejected client credentials");
        Err(AppError::InvalidClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, auth.parse().unwrap());
        h
    }

    #[test]
    fn test_parse_authorization() {
        assert_eq!(parse_authorization(&HeaderMap::new()), Ok(None));
        assert_eq!(parse_authorization(&headers("Bearer abc")), Ok(Some("abc")));
        assert_eq!(parse_authorization(&headers("bearer   abc  ")), Ok(Some("abc")));
        assert_eq!(parse_authorization(&headers("Basic abc")), Err(AuthError::InvalidHeader));
        assert_eq!(parse_authorization(&headers("Bearer")), Err(AuthError::InvalidHeader));
        assert_eq!(parse_authorization(&headers("Bearer a b")), Err(AuthError::InvalidHeader));
        assert_eq!(parse_authorization(&headers("abc")), Err(AuthError::InvalidHeader));
    }

    #[tokio::test]
    async fn test_authenticate_missing_header() {
        let svc = TokenService::new(TieredCache::in_memory(), "secret");
        assert!(authenticate(&svc, &HeaderMap::new(), false).await.unwrap().is_none());
        let err = authenticate(&svc, &HeaderMap::new(), true).await.unwrap_err();
        assert_eq!(err.code(), "missing_token");
    }

    #[tokio::test]
    async fn test_authenticate_with_token() {
        let svc = TokenService::new(TieredCache::in_memory(), "secret");
        let issued = svc.issue_token("t", &["search.read"], 1).await.unwrap();
        let auth = format!("Bearer {}", issued.access_token);
        let record = authenticate(&svc, &headers(&auth), true).await.unwrap().unwrap();
        assert_eq!(record.hash, issued.hash);

        let err = authenticate(&svc, &headers("Bearer loupe_forged"), false).await.unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn test_scope_checks() {
        let anon = Caller::anonymous("127.0.0.1");
        assert!(anon.require_scope("schema.read").is_ok());

        let record = TokenRecord {
            hash: "ab".repeat(32),
            label: "t".into(),
            scopes: ["search.read".to_string()].into(),
            issued_at: 0,
            expires_at: 0,
            last_used: None,
        };
        let caller = Caller::new("127.0.0.1", Some(record));
        assert!(caller.require_scope("search.read").is_ok());
        assert_eq!(caller.require_scope("schema.read").unwrap_err().code(), "insufficient_scope");
        assert_ne!(caller.identity(), anon.identity());
    }

    #[test]
    fn test_verify_client() {
        let mut cfg = Config::from_lookup(|_| None).unwrap();
        assert!(verify_client(&cfg, None, None, true).is_ok());
        assert!(verify_client(&cfg, None, None, false).is_err());

        cfg.client_secret = Some("s3cret".into());
        assert!(verify_client(&cfg, Some("loupe-mcp"), Some("s3cret"), false).is_ok());
        assert!(verify_client(&cfg, Some("loupe-mcp"), Some("wrong"), true).is_err());
        assert!(verify_client(&cfg, Some("other"), Some("s3cret"), false).is_err());
    }
}
