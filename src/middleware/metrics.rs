//! Prometheus metrics recorder for the Loupe MCP gateway.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Metrics are updated once per `/commands` call via `record_command()`.

use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

use crate::mcp::types::Command;

pub struct Metrics {
    registry: Registry,
    commands_total: IntCounterVec,
    errors_total: IntCounterVec,
    command_duration_seconds: HistogramVec,
    search_cache_total: IntCounterVec,
}

impl Metrics {
    /// Create a recorder with its own registry, so several app instances can
    /// coexist in one process (tests).
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let commands_total = IntCounterVec::new(
            opts!("loupe_commands_total", "Total number of dispatched commands"),
            &["command", "status_code"],
        )?;
        let errors_total = IntCounterVec::new(
            opts!("loupe_errors_total", "Total command errors by code"),
            &["code"],
        )?;
        let command_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "loupe_command_duration_seconds",
                "Command latency in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
            ),
            &["command"],
        )?;
        let search_cache_total = IntCounterVec::new(
            opts!("loupe_search_cache_total", "Search result cache lookups"),
            &["result"],
        )?;

        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(command_duration_seconds.clone()))?;
        registry.register(Box::new(search_cache_total.clone()))?;

        Ok(Self {
            registry,
            commands_total,
            errors_total,
            command_duration_seconds,
            search_cache_total,
        })
    }

    /// Record one `/commands` call. Unknown command names are bucketed so
    /// callers cannot blow up label cardinality.
    pub fn record_command(&self, command: Option<&str>, status: u16, error_code: Option<&str>, elapsed_secs: f64) {
        let label = command
            .and_then(Command::from_name)
            .map(|c| c.name())
            .unwrap_or("other");
        let status = status.to_string();

        self.commands_total.with_label_values(&[label, &status]).inc();
        self.command_duration_seconds
            .with_label_values(&[label])
            .observe(elapsed_secs);
        if let Some(code) = error_code {
            self.errors_total.with_label_values(&[code]).inc();
        }
    }

    pub fn record_search_cache(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.search_cache_total.with_label_values(&[result]).inc();
    }

    /// Encode all registered metrics as Prometheus text format.
    /// Called by the `/metrics` HTTP handler.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

// ── Tests ─────────────────────────────────────────────────────
