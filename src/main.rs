use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loupe_mcp::auth::verify_client;
use loupe_mcp::cli::{self, render_issued_token, render_reindex_counts, render_token_list, IssuedTokenOutput};
use loupe_mcp::{api, config, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "loupe-mcp"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "loupe_mcp=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::IssueToken {
            client_id,
            client_secret,
            scopes,
            label,
            ttl_hours,
            format,
        }) => {
            verify_client(&cfg, client_id.as_deref(), client_secret.as_deref(), true)?;
            let state = AppState::bootstrap(cfg).await?;
            if !state.cache.is_persistent() {
                tracing::warn!("REDIS_URL is not set: this token only lives in this process and is lost on exit");
            }
            let issued = state.tokens.issue_token(&label, &scopes, ttl_hours).await?;
            println!("{}", render_issued_token(&IssuedTokenOutput::from(&issued), format)?);
            Ok(())
        }
        Some(cli::Commands::ListTokens) => {
            let state = AppState::bootstrap(cfg).await?;
            println!("{}", render_token_list(&state.tokens.list_tokens().await?));
            Ok(())
        }
        Some(cli::Commands::RevokeToken { hash, all }) => {
            let state = AppState::bootstrap(cfg).await?;
            if all {
                let count = state.tokens.revoke_all_tokens().await?;
                println!("Revoked {} token(s).", count);
            } else if let Some(hash) = hash {
                if state.tokens.revoke_token(&hash).await? {
                    println!("Token revoked.");
                } else {
                    println!("Token not found or already revoked.");
                }
            }
            Ok(())
        }
        Some(cli::Commands::Reindex { url, token }) => {
            let endpoint = match url {
                Some(origin) => format!("{}/admin/reindex", origin.trim_end_matches('/')),
                None => cfg.endpoint("admin/reindex"),
            };
            let counts = cli::request_reindex(&endpoint, &token).await?;
            println!("{}", render_reindex_counts(&counts));
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState::bootstrap(cfg).await?);

    tracing::info!("Building search index...");
    let sync_from = chrono::Utc::now();
    let counts = state.indexer.reindex_all().await?;
    tracing::info!(?counts, "Search index ready");

    let app = api::router(state.clone());

    jobs::cleanup::spawn(state.cache.clone());
    tracing::info!("Background cache eviction started (every 60s)");

    if state.config.sync_interval_secs > 0 {
        let every = Duration::from_secs(state.config.sync_interval_secs);
        jobs::sync::spawn(state.clone(), sync_from, every);
        tracing::info!("Content sync started (every {}s)", state.config.sync_interval_secs);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Loupe MCP gateway listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
