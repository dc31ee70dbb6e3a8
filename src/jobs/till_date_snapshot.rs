//! Till-Date Snapshot Job
//!
//! Once a day, at a fixed UTC hour, recomputes all-history volume and the
//! three leaderboards up to the end of yesterday and stores them under the
//! `*-till-date` keys. The summary rollup merges today's figures on top.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::models::transaction::TillDateSnapshot;
use crate::services::transfer_analytics::{AnalyticsError, TransferAnalytics};

/// Default run hour (01:00 UTC)
pub const DEFAULT_SNAPSHOT_HOUR_UTC: u32 = 1;

/// Start the daily snapshot job; `hour_utc` must be in `0..=23`
pub async fn start_till_date_snapshot_job(
    analytics: Arc<TransferAnalytics>,
    hour_utc: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(hour_utc = hour_utc, "Till-date snapshot job started");

        loop {
            let wait = duration_until_next_run(Utc::now(), hour_utc);
            info!(
                wait_secs = wait.as_secs(),
                "Next till-date snapshot scheduled"
            );

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping till-date snapshot job");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    let _ = run_till_date_snapshot(&analytics).await;
                }
            }
        }

        info!("Till-date snapshot job stopped");
    })
}

pub async fn run_till_date_snapshot(
    analytics: &TransferAnalytics,
) -> Result<TillDateSnapshot, AnalyticsError> {
    match analytics.refresh_till_date_snapshot().await {
        Ok(snapshot) => {
            info!(
                cutoff = %snapshot.cutoff,
                volume = %snapshot.volume,
                "Till-date snapshot completed"
            );
            Ok(snapshot)
        }
        Err(e) => {
            error!(error = %e, "Till-date snapshot failed, previous snapshot kept");
            Err(e)
        }
    }
}

/// Time from `now` to the next `hour_utc:00:00`, strictly in the future
pub fn duration_until_next_run(now: DateTime<Utc>, hour_utc: u32) -> Duration {
    let run_time = NaiveTime::from_hms_opt(hour_utc.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let mut next = now.date_naive().and_time(run_time).and_utc();
    if next <= now {
        next += ChronoDuration::days(1);
    }

    (next - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_waits_until_later_today() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 30, 0).unwrap();
        assert_eq!(duration_until_next_run(now, 1), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_rolls_over_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 1, 0, 0).unwrap();
        assert_eq!(duration_until_next_run(now, 1), Duration::from_secs(24 * 3600));

        let now = Utc.with_ymd_and_hms(2025, 1, 15, 22, 0, 0).unwrap();
        assert_eq!(duration_until_next_run(now, 1), Duration::from_secs(3 * 3600));
    }
}
