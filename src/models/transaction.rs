//! Transfer analytics request/response models
//!
//! Query shapes for volume and leaderboard lookups, the resolved time window
//! they run over, and the result types that are cached and returned.
//!
//! Volumes are `Decimal` and serialize as exact decimal strings
//! (`"volume":"12.5"`); rendering them as JSON numbers is left to the API
//! edge, which converts with `to_f64`.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Participation of an account in a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Recipient,
    /// Sender and recipient identities unioned into one ranking
    Total,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Recipient => "recipient",
            Role::Total => "total",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender" => Ok(Role::Sender),
            "recipient" => Ok(Role::Recipient),
            "total" => Ok(Role::Total),
            other => Err(format!(
                "Invalid role: '{}'. Must be one of: sender, recipient, total",
                other
            )),
        }
    }
}

/// Query parameters for total transferred volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// 0x-prefixed account address
    pub address: Option<String>,
    #[serde(rename = "as")]
    pub role: Option<Role>,
    #[serde(default = "default_from_cache")]
    pub from_cache: bool,
}

impl Default for VolumeQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            address: None,
            role: None,
            from_cache: true,
        }
    }
}

/// Query parameters for the ranked account leaderboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopAccountsQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Defaults to `total` when absent
    #[serde(rename = "as")]
    pub role: Option<Role>,
    #[serde(default = "default_from_cache")]
    pub from_cache: bool,
}

impl Default for TopAccountsQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            start_date: None,
            end_date: None,
            role: None,
            from_cache: true,
        }
    }
}

fn default_page() -> u64 {
    1
}

fn default_limit() -> u64 {
    10
}

fn default_from_cache() -> bool {
    true
}

/// Inclusive `[start, end]` range over ingestion time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Resolve optional date bounds into a window.
    ///
    /// `start` defaults to the epoch and `end` to `now`; `end` is then pushed
    /// to the last instant of its calendar day. Accepts `YYYY-MM-DD` or an
    /// RFC 3339 instant for either bound.
    pub fn resolve(
        start: Option<&str>,
        end: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, String> {
        let start = match start {
            Some(raw) => parse_date_bound(raw, "startDate")?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        let end = match end {
            Some(raw) => parse_date_bound(raw, "endDate")?,
            None => now,
        };
        let end = end_of_day(end.date_naive())
            .ok_or_else(|| format!("Invalid endDate: {} is out of range", end.date_naive()))?;

        if start > end {
            return Err(format!(
                "startDate ({}) must not be after endDate ({})",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ));
        }

        Ok(Self { start, end })
    }

    /// Whole calendar day containing `day`, `None` for the last representable day
    pub fn day(day: NaiveDate) -> Option<Self> {
        Some(Self {
            start: start_of_day(day),
            end: end_of_day(day)?,
        })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    /// Stable fragment for cache keys
    pub fn cache_fragment(&self) -> String {
        format!(
            "{}-{}",
            self.start.timestamp_millis(),
            self.end.timestamp_millis()
        )
    }
}

fn parse_date_bound(raw: &str, field: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(start_of_day(date));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|_| format!("Invalid {}: '{}'", field, raw))
}

pub fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Last instant (microsecond precision) of `day`; `None` when the next day
/// is not representable
pub fn end_of_day(day: NaiveDate) -> Option<DateTime<Utc>> {
    start_of_day(day)
        .checked_add_signed(Duration::days(1))?
        .checked_sub_signed(Duration::microseconds(1))
}

/// Validate a `0x` + 40 hex address and return its lower-cased form
pub fn normalize_address(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let valid = trimmed.len() == 42
        && trimmed.starts_with("0x")
        && trimmed[2..].chars().all(|c| c.is_ascii_hexdigit());

    if valid {
        Ok(trimmed.to_lowercase())
    } else {
        Err(format!(
            "Invalid address: '{}'. Must be 0x followed by 40 hex characters",
            raw
        ))
    }
}

/// Total transferred volume; `volume` serializes as a decimal string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeResult {
    pub volume: Decimal,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

/// One ranked leaderboard row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountVolume {
    pub address: String,
    pub volume: Decimal,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u64,
    pub page: u64,
    /// Next page number, `None` when no further rows exist
    pub next: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopAccountsResult {
    pub accounts: Vec<AccountVolume>,
    pub pagination: Pagination,
}

/// The three rankings reported per time frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboards {
    pub top_accounts: Vec<AccountVolume>,
    pub top_receivers: Vec<AccountVolume>,
    pub top_senders: Vec<AccountVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSummary {
    pub all_time: Decimal,
    pub today: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSummary {
    pub all_time: Leaderboards,
    pub today: Leaderboards,
}

/// Composite dashboard payload served under the `summary` cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub volume: VolumeSummary,
    pub top_accounts: LeaderboardSummary,
}

/// Aggregates over all history up to the end of `cutoff`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TillDateSnapshot {
    pub cutoff: NaiveDate,
    pub volume: Decimal,
    pub leaderboards: Leaderboards,
}
