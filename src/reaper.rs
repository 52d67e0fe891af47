use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Periodically auto-cancel appointments left scheduled a day past their start.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep_overdue(None, chrono::Utc::now().naive_utc()).await {
            Ok(0) => debug!("reaper: nothing overdue"),
            Ok(n) => info!("reaper cancelled {n} overdue appointments"),
            Err(e) => warn!("reaper sweep failed: {e}"),
        }
    }
}

/// Compact the WAL whenever enough appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
