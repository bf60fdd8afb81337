use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

use crate::processor::Processor;

/// Periodically logs how many scans are queued and how many have been
/// dispatched. Stops only on a fatal datastore error.
pub async fn scan_stats(processor: Arc<Processor>, interval: Duration) {
    let first = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(first, interval);

    loop {
        ticker.tick().await;

        match processor.scans_remaining() {
            Ok(remaining) => {
                info!(
                    "Scan stats: remaining={remaining} processed={}",
                    processor.scans_processed()
                );
            }
            Err(err) if err.is_fatal() => {
                error!("Fatal error determining amount of remaining scans, scan stats stopped: {err}");
                return;
            }
            Err(err) => {
                error!("Failed determining amount of remaining scans: {err}");
            }
        }
    }
}
