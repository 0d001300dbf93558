use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::now_ms;

/// Background task that flips confirmed bookings whose window closed
/// without a check-in to no_show.
pub async fn run_no_show_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let overdue = engine.collect_no_shows(now_ms());
        for booking_id in overdue {
            match engine.mark_no_show(booking_id).await {
                Ok(_) => {
                    info!("marked no-show: {booking_id}");
                    metrics::counter!(crate::observability::NO_SHOWS_TOTAL).increment(1);
                }
                Err(e) => {
                    // May have checked in or been cancelled since the scan
                    tracing::debug!("no-show sweep skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
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
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
