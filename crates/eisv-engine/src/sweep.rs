//! Background inactivity sweep

use crate::governor::Governor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Periodically archive idle agents until cancelled. The interval is re-read
/// from the live config on every tick.
pub fn spawn_inactivity_sweeper(
    governor: Arc<Governor>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("inactivity sweeper started");
        loop {
            let secs = governor.config().lifecycle.sweep_interval_secs.max(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    if let Err(e) = governor.archive_inactive().await {
                        warn!("inactivity sweep failed: {}", e);
                    }
                }
            }
        }
    })
}
