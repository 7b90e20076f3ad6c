use clap::{Parser, Subcommand, ValueEnum};

use std::collections::BTreeMap;

use anyhow::Context;
use serde::Serialize;

use crate::auth::{IssuedToken, TokenRecord, TokenResponse};
use crate::mcp::types::Envelope;

/// Loupe MCP: bearer-authenticated search gateway for site content
#[derive(Parser)]
#[command(name = "loupe-mcp", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to LOUPE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Issue a bearer token (printed once, never stored)
    IssueToken {
        #[arg(long = "client_id", alias = "client-id")]
        client_id: Option<String>,
        #[arg(long = "client_secret", alias = "client-secret")]
        client_secret: Option<String>,
        /// Comma-separated scopes; unknown scopes are dropped
        #[arg(long, value_delimiter = ',', default_value = "search.read")]
        scopes: Vec<String>,
        #[arg(long, default_value = "cli")]
        label: String,
        /// 0 = never expires; capped at 168
        #[arg(long, default_value = "24")]
        ttl_hours: u64,
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },

    /// List issued tokens (hashes and metadata only)
    ListTokens,

    /// Revoke one token by hash (or a unique prefix of 8+ characters), or every token
    RevokeToken {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        hash: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Ask a running server to rebuild its search index
    Reindex {
        /// Server origin (defaults to LOUPE_BASE_URL)
        #[arg(long)]
        url: Option<String>,
        /// Bearer token holding the index.write scope
        #[arg(long, env = "LOUPE_ADMIN_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// What `issue-token` prints: the OAuth response plus the hash needed to
/// revoke the token later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssuedTokenOutput {
    #[serde(flatten)]
    pub token: TokenResponse,
    pub hash: String,
}

impl From<&IssuedToken> for IssuedTokenOutput {
    fn from(issued: &IssuedToken) -> Self {
        Self {
            token: TokenResponse::from(issued),
            hash: issued.hash.clone(),
        }
    }
}

pub fn render_issued_token(output: &IssuedTokenOutput, format: OutputFormat) -> anyhow::Result<String> {
    let token = &output.token;
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(output)?,
        OutputFormat::Table => format!(
            "{:<14} {}\n{:<14} {}\n{:<14} {}\n{:<14} {}\n{:<14} {}",
            "access_token", token.access_token,
            "token_type", token.token_type,
            "expires_in", token.expires_in,
            "scope", token.scope,
            "hash", output.hash,
        ),
        OutputFormat::Csv => format!(
            "access_token,token_type,expires_in,scope,hash\n{},{},{},{},{}",
            csv_field(&token.access_token),
            csv_field(&token.token_type),
            token.expires_in,
            csv_field(&token.scope),
            csv_field(&output.hash),
        ),
    })
}

/// POST to a running server's `/admin/reindex` and return the per-type
/// document counts it reports.
pub async fn request_reindex(endpoint: &str, token: &str) -> anyhow::Result<BTreeMap<String, usize>> {
    let resp = reqwest::Client::new()
        .post(endpoint)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("could not reach {}", endpoint))?;
    let status = resp.status();
    let envelope: Envelope = resp
        .json()
        .await
        .with_context(|| format!("unexpected response from {} ({})", endpoint, status))?;

    if !envelope.success {
        let reason = envelope
            .error
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_else(|| status.to_string());
        anyhow::bail!("reindex rejected: {}", reason);
    }
    serde_json::from_value(envelope.data["counts"].clone()).context("reindex response carried no counts")
}

pub fn render_reindex_counts(counts: &BTreeMap<String, usize>) -> String {
    counts
        .iter()
        .map(|(post_type, count)| format!("{:<20} {}", post_type, count))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_token_list(records: &[TokenRecord]) -> String {
    if records.is_empty() {
        return "No tokens issued.".to_string();
    }
    let mut out = format!(
        "{:<66} {:<20} {:<34} {:<12} {:<12}",
        "HASH", "LABEL", "SCOPES", "EXPIRES_AT", "LAST_USED"
    );
    for r in records {
        let expires = if r.expires_at == 0 {
            "never".to_string()
        } else {
            r.expires_at.to_string()
        };
        let last_used = r
            .last_used
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "\n{:<66} {:<20} {:<34} {:<12} {:<12}",
            r.hash,
            r.label,
            r.scope_string(),
            expires,
            last_used
        ));
    }
    out
}
