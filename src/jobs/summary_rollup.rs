//! Summary Rollup Job
//!
//! Recomputes the `summary` cache entry on a fixed interval so dashboard
//! reads stay cache hits. Stops on SIGINT.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use crate::models::transaction::Summary;
use crate::services::transfer_analytics::{AnalyticsError, TransferAnalytics};

/// Default rollup period (3 minutes)
pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(180);

/// Start the summary rollup job.
///
/// The first tick fires immediately, so the summary exists shortly after
/// startup. A failed run is logged and retried on the next tick.
pub async fn start_summary_rollup_job(
    analytics: Arc<TransferAnalytics>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = period.as_secs(), "Summary rollup job started");
        let mut interval = interval(period);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping summary rollup job");
                    break;
                }
                _ = interval.tick() => {
                    // Failures are already logged inside
                    let _ = run_summary_rollup(&analytics).await;
                }
            }
        }

        info!("Summary rollup job stopped");
    })
}

/// One rollup run
pub async fn run_summary_rollup(
    analytics: &TransferAnalytics,
) -> Result<Summary, AnalyticsError> {
    match analytics.refresh_summary().await {
        Ok(summary) => {
            info!(
                all_time_volume = %summary.volume.all_time,
                today_volume = %summary.volume.today,
                "Summary rollup completed"
            );
            Ok(summary)
        }
        Err(e) => {
            error!(error = %e, "Summary rollup failed, retrying next tick");
            Err(e)
        }
    }
}
