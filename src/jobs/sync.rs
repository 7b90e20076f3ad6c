//! Background job: push content changes into the search index.
//!
//! Every tick asks the content store for posts modified after the last
//! change seen and re-indexes each one. Publishing, editing, unpublishing
//! and trashing all move `modified`; hard deletes do not and go through
//! `DELETE /admin/index/{post_type}/{id}` or a rebuild.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time;

use crate::search::indexer::IndexOutcome;
use crate::AppState;

/// Result of one sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPass {
    pub indexed: usize,
    pub removed: usize,
    /// Newest modification time seen; the next pass starts after it.
    pub watermark: DateTime<Utc>,
}

/// Spawn the sync loop starting after `since`. Call this once at startup
/// with the time captured before the initial rebuild.
pub fn spawn(state: Arc<AppState>, since: DateTime<Utc>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut watermark = since;
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match run_once(&state, watermark).await {
                Ok(pass) => watermark = pass.watermark,
                Err(e) => tracing::warn!(error = %e, "index sync failed; retrying next tick"),
            }
        }
    })
}

pub async fn run_once(state: &AppState, since: DateTime<Utc>) -> anyhow::Result<SyncPass> {
    let changed = state.content.modified_since(since).await?;
    let mut pass = SyncPass {
        indexed: 0,
        removed: 0,
        watermark: since,
    };

    for (id, modified) in changed {
        match state.indexer.index_post(id).await? {
            IndexOutcome::Indexed => pass.indexed += 1,
            IndexOutcome::Removed => pass.removed += 1,
            IndexOutcome::Skipped => {}
        }
        pass.watermark = pass.watermark.max(modified);
    }

    if pass.indexed + pass.removed > 0 {
        tracing::info!(indexed = pass.indexed, removed = pass.removed, "synced content changes into index");
    }
    Ok(pass)
}
