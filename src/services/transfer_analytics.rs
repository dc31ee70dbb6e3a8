//! Transfer Analytics (aggregation engine)
//!
//! Answers volume and leaderboard queries over arbitrary date ranges from
//! the Transaction Store, memoizes them in the Result Cache, and builds the
//! `summary` and `*-till-date` snapshots the scheduler keeps fresh.
//!
//! Store failures always reach the caller; cache failures never do.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::models::transaction::{
    AccountVolume, LeaderboardSummary, Leaderboards, Pagination, Role, Summary, TillDateSnapshot,
    TimeWindow, TopAccountsQuery, TopAccountsResult, VolumeQuery, VolumeResult, VolumeSummary,
    normalize_address,
};
use crate::services::result_cache::{CacheLayer, ResultCache};
use crate::services::transaction_store::{
    GroupField, StoreError, TransactionFilter, TransactionStore,
};

/// Snapshot cache keys
pub mod keys {
    pub const SUMMARY: &str = "summary";
    pub const VOLUME_TILL_DATE: &str = "volume-till-date";
    pub const TOP_ACCOUNTS_TILL_DATE: &str = "topAccount-till-date";
    pub const TOP_RECEIVERS_TILL_DATE: &str = "topReciever-till-date";
    pub const TOP_SENDERS_TILL_DATE: &str = "topSender-till-date";
    /// Last day covered by the `*-till-date` keys, written after them
    pub const TILL_DATE_CUTOFF: &str = "till-date-cutoff";
}

/// Rows kept in every summary leaderboard
pub const LEADERBOARD_SIZE: u64 = 25;

/// Largest page a caller may request
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any I/O
    Client,
    Server,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("{0}")]
    InvalidQuery(String),
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl AnalyticsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalyticsError::InvalidQuery(_) => ErrorKind::Client,
            AnalyticsError::Store(_) | AnalyticsError::Timeout { .. } => ErrorKind::Server,
        }
    }

    /// HTTP status for the API layer
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Client => 400,
            ErrorKind::Server => 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    /// TTL of query-memo cache entries
    pub memo_ttl: Duration,
    /// Bound on every store and cache round-trip
    pub query_timeout: Duration,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            memo_ttl: Duration::from_secs(150),
            query_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TransferAnalytics {
    store: Arc<dyn TransactionStore>,
    cache: CacheLayer,
    settings: AnalyticsSettings,
}

impl TransferAnalytics {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        cache: Arc<dyn ResultCache>,
        settings: AnalyticsSettings,
    ) -> Self {
        Self {
            store,
            cache: CacheLayer::new(cache, settings.query_timeout),
            settings,
        }
    }

    /// Total volume in the query window, optionally restricted to an address
    pub async fn get_total_transferred(
        &self,
        query: &VolumeQuery,
    ) -> Result<VolumeResult, AnalyticsError> {
        self.total_transferred_at(query, Utc::now()).await
    }

    pub async fn total_transferred_at(
        &self,
        query: &VolumeQuery,
        now: DateTime<Utc>,
    ) -> Result<VolumeResult, AnalyticsError> {
        let window = TimeWindow::resolve(query.start_date.as_deref(), query.end_date.as_deref(), now)
            .map_err(AnalyticsError::InvalidQuery)?;
        let address = query
            .address
            .as_deref()
            .map(normalize_address)
            .transpose()
            .map_err(AnalyticsError::InvalidQuery)?;

        let cache_key = volume_cache_key(&window, address.as_deref(), query.role);
        if query.from_cache {
            if let Some(cached) = self.cache.read::<VolumeResult>(&cache_key).await {
                return Ok(cached);
            }
        }

        let filter = TransactionFilter::for_address(window, address, query.role);
        let volume = self
            .bounded("volume sum", self.store.sum_amount(&filter))
            .await?
            .unwrap_or(Decimal::ZERO);

        let result = VolumeResult {
            volume,
            role: query.role,
        };
        self.cache
            .store_detached(&cache_key, &result, Some(self.settings.memo_ttl));

        Ok(result)
    }

    /// Ranked accounts by summed volume for the query's role
    pub async fn get_top_accounts(
        &self,
        query: &TopAccountsQuery,
    ) -> Result<TopAccountsResult, AnalyticsError> {
        self.top_accounts_at(query, Utc::now()).await
    }

    pub async fn top_accounts_at(
        &self,
        query: &TopAccountsQuery,
        now: DateTime<Utc>,
    ) -> Result<TopAccountsResult, AnalyticsError> {
        if query.page < 1 {
            return Err(AnalyticsError::InvalidQuery(
                "page must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&query.limit) {
            return Err(AnalyticsError::InvalidQuery(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let window = TimeWindow::resolve(query.start_date.as_deref(), query.end_date.as_deref(), now)
            .map_err(AnalyticsError::InvalidQuery)?;
        let role = query.role.unwrap_or(Role::Total);
        let offset = (query.page - 1)
            .checked_mul(query.limit)
            .filter(|offset| i64::try_from(*offset).is_ok())
            .ok_or_else(|| AnalyticsError::InvalidQuery("page is out of range".to_string()))?;

        let cache_key = format!(
            "top-accounts-{}-{}-{}-{}",
            window.cache_fragment(),
            query.page,
            query.limit,
            role
        );
        if query.from_cache {
            if let Some(cached) = self.cache.read::<TopAccountsResult>(&cache_key).await {
                return Ok(cached);
            }
        }

        // One extra row tells whether a further page exists
        let mut rows = self
            .bounded(
                "top accounts",
                self.store.grouped_sum(
                    GroupField::from(role),
                    &TransactionFilter::unrestricted(window),
                    query.limit + 1,
                    offset,
                ),
            )
            .await?;

        let next = if rows.len() as u64 > query.limit {
            rows.truncate(query.limit as usize);
            Some(query.page + 1)
        } else {
            None
        };

        let result = TopAccountsResult {
            accounts: rows
                .into_iter()
                .map(|row| AccountVolume {
                    address: row.address,
                    volume: row.volume,
                    role: Some(role),
                })
                .collect(),
            pagination: Pagination {
                limit: query.limit,
                page: query.page,
                next,
            },
        };
        self.cache
            .store_detached(&cache_key, &result, Some(self.settings.memo_ttl));

        Ok(result)
    }

    /// Cached summary, computed and stored on a miss
    pub async fn get_summary(&self) -> Result<Summary, AnalyticsError> {
        if let Some(cached) = self.cache.read::<Summary>(keys::SUMMARY).await {
            return Ok(cached);
        }
        self.refresh_summary().await
    }

    /// Recompute the summary and overwrite the `summary` key
    pub async fn refresh_summary(&self) -> Result<Summary, AnalyticsError> {
        self.refresh_summary_at(Utc::now()).await
    }

    pub async fn refresh_summary_at(&self, now: DateTime<Utc>) -> Result<Summary, AnalyticsError> {
        let summary = self.compute_summary(now).await.map_err(|e| {
            error!(error = %e, "Failed to compute summary");
            e
        })?;

        self.cache
            .store_best_effort(keys::SUMMARY, &summary, None)
            .await;

        Ok(summary)
    }

    /// Recompute the all-history aggregates up to the end of yesterday and
    /// overwrite the four `*-till-date` keys
    pub async fn refresh_till_date_snapshot(&self) -> Result<TillDateSnapshot, AnalyticsError> {
        self.refresh_till_date_snapshot_at(Utc::now()).await
    }

    pub async fn refresh_till_date_snapshot_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<TillDateSnapshot, AnalyticsError> {
        let cutoff = now.date_naive() - ChronoDuration::days(1);
        let end_date = Some(cutoff.format("%Y-%m-%d").to_string());

        let volume_query = VolumeQuery {
            end_date: end_date.clone(),
            from_cache: false,
            ..Default::default()
        };
        let (volume, leaderboards) = tokio::try_join!(
            self.total_transferred_at(&volume_query, now),
            self.leaderboards(None, end_date, now),
        )?;

        self.cache
            .store_best_effort(keys::VOLUME_TILL_DATE, &volume.volume, None)
            .await;
        self.cache
            .store_best_effort(keys::TOP_ACCOUNTS_TILL_DATE, &leaderboards.top_accounts, None)
            .await;
        self.cache
            .store_best_effort(keys::TOP_RECEIVERS_TILL_DATE, &leaderboards.top_receivers, None)
            .await;
        self.cache
            .store_best_effort(keys::TOP_SENDERS_TILL_DATE, &leaderboards.top_senders, None)
            .await;
        self.cache
            .store_best_effort(keys::TILL_DATE_CUTOFF, &cutoff, None)
            .await;

        info!(
            cutoff = %cutoff,
            volume = %volume.volume,
            accounts = leaderboards.top_accounts.len(),
            "Till-date snapshot refreshed"
        );

        Ok(TillDateSnapshot {
            cutoff,
            volume: volume.volume,
            leaderboards,
        })
    }

    async fn compute_summary(&self, now: DateTime<Utc>) -> Result<Summary, AnalyticsError> {
        let today = Some(now.date_naive().format("%Y-%m-%d").to_string());
        let today_volume_query = VolumeQuery {
            start_date: today.clone(),
            from_cache: false,
            ..Default::default()
        };

        let (today_volume, today_boards) = tokio::try_join!(
            self.total_transferred_at(&today_volume_query, now),
            self.leaderboards(today, None, now),
        )?;
        let today_volume = today_volume.volume;

        // Till-date keys are only merged when they end exactly yesterday
        let yesterday = now.date_naive() - ChronoDuration::days(1);
        let snapshot_fresh =
            self.cache.read::<NaiveDate>(keys::TILL_DATE_CUTOFF).await == Some(yesterday);
        if !snapshot_fresh {
            warn!(expected_cutoff = %yesterday, "Till-date snapshot missing or stale, recomputing full range");
        }

        let till_date_volume = if snapshot_fresh {
            self.cache.read::<Decimal>(keys::VOLUME_TILL_DATE).await
        } else {
            None
        };
        let all_time_volume = match till_date_volume {
            Some(till_date) => till_date + today_volume,
            None => {
                let full_range = VolumeQuery {
                    from_cache: false,
                    ..Default::default()
                };
                self.total_transferred_at(&full_range, now).await?.volume
            }
        };

        let (top_accounts, top_receivers, top_senders) = tokio::try_join!(
            self.all_time_leaderboard(
                keys::TOP_ACCOUNTS_TILL_DATE,
                snapshot_fresh,
                Role::Total,
                &today_boards.top_accounts,
                now
            ),
            self.all_time_leaderboard(
                keys::TOP_RECEIVERS_TILL_DATE,
                snapshot_fresh,
                Role::Recipient,
                &today_boards.top_receivers,
                now
            ),
            self.all_time_leaderboard(
                keys::TOP_SENDERS_TILL_DATE,
                snapshot_fresh,
                Role::Sender,
                &today_boards.top_senders,
                now
            ),
        )?;

        Ok(Summary {
            volume: VolumeSummary {
                all_time: all_time_volume,
                today: today_volume,
            },
            top_accounts: LeaderboardSummary {
                all_time: Leaderboards {
                    top_accounts,
                    top_receivers,
                    top_senders,
                },
                today: today_boards,
            },
        })
    }

    /// Till-date snapshot merged with today, or a full-range recompute
    /// when the snapshot is stale, missing or unreadable
    async fn all_time_leaderboard(
        &self,
        snapshot_key: &str,
        snapshot_fresh: bool,
        role: Role,
        today: &[AccountVolume],
        now: DateTime<Utc>,
    ) -> Result<Vec<AccountVolume>, AnalyticsError> {
        let till_date = if snapshot_fresh {
            self.cache.read::<Vec<AccountVolume>>(snapshot_key).await
        } else {
            None
        };
        match till_date {
            Some(till_date) => Ok(merge_leaderboards(
                role,
                &till_date,
                today,
                LEADERBOARD_SIZE as usize,
            )),
            None => self.leaderboard(role, None, None, now).await,
        }
    }

    async fn leaderboards(
        &self,
        start_date: Option<String>,
        end_date: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Leaderboards, AnalyticsError> {
        let (top_accounts, top_receivers, top_senders) = tokio::try_join!(
            self.leaderboard(Role::Total, start_date.clone(), end_date.clone(), now),
            self.leaderboard(Role::Recipient, start_date.clone(), end_date.clone(), now),
            self.leaderboard(Role::Sender, start_date, end_date, now),
        )?;

        Ok(Leaderboards {
            top_accounts,
            top_receivers,
            top_senders,
        })
    }

    async fn leaderboard(
        &self,
        role: Role,
        start_date: Option<String>,
        end_date: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AccountVolume>, AnalyticsError> {
        let query = TopAccountsQuery {
            page: 1,
            limit: LEADERBOARD_SIZE,
            start_date,
            end_date,
            role: Some(role),
            from_cache: false,
        };
        Ok(self.top_accounts_at(&query, now).await?.accounts)
    }

    /// Run a store call under the query timeout, logging failures
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, AnalyticsError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.settings.query_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation = operation, error = %e, "Transaction store query failed");
                Err(AnalyticsError::Store(e))
            }
            Err(_) => {
                error!(
                    operation = operation,
                    timeout_ms = self.settings.query_timeout.as_millis() as u64,
                    "Transaction store query timed out"
                );
                Err(AnalyticsError::Timeout {
                    operation,
                    after: self.settings.query_timeout,
                })
            }
        }
    }
}

fn volume_cache_key(window: &TimeWindow, address: Option<&str>, role: Option<Role>) -> String {
    let role = role.map(|r| r.as_str()).unwrap_or("any");
    match address {
        Some(address) => format!("volume-{}-{}-{}", window.cache_fragment(), address, role),
        None => format!("volume-{}-{}", window.cache_fragment(), role),
    }
}

/// Add per-address volumes of two rankings, re-rank and keep `size` rows
pub fn merge_leaderboards(
    role: Role,
    till_date: &[AccountVolume],
    today: &[AccountVolume],
    size: usize,
) -> Vec<AccountVolume> {
    let mut totals: HashMap<&str, Decimal> = HashMap::new();
    for row in till_date.iter().chain(today) {
        *totals.entry(row.address.as_str()).or_insert(Decimal::ZERO) += row.volume;
    }

    let mut merged: Vec<AccountVolume> = totals
        .into_iter()
        .map(|(address, volume)| AccountVolume {
            address: address.to_string(),
            volume,
            role: Some(role),
        })
        .collect();
    merged.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.address.cmp(&b.address)));
    merged.truncate(size);
    merged
}
