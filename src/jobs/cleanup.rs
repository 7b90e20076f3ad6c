//! Background job: evict expired entries from the in-process cache tier.
//!
//! Runs every minute. Rate-limit windows and validation entries carry
//! TTLs but are only dropped lazily on read; this bounds memory for keys
//! that are never read again.

use std::time::Duration;

use tokio::time;

use crate::cache::TieredCache;

const EVICTION_INTERVAL_SECS: u64 = 60;

/// Spawn the background eviction task. Call this once at startup.
pub fn spawn(cache: TieredCache) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(EVICTION_INTERVAL_SECS));
        loop {
            interval.tick().await;
            run_once(&cache);
        }
    })
}

pub fn run_once(cache: &TieredCache) -> usize {
    let evicted = cache.evict_expired();
    if evicted > 0 {
        tracing::debug!(evicted = evicted, remaining = cache.local_len(), "evicted expired cache entries");
    }
    evicted
}
