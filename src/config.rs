//! Environment configuration
//!
//! `main` calls `dotenvy::dotenv()` before `IndexerConfig::from_env()`.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::jobs::summary_rollup::DEFAULT_SUMMARY_INTERVAL;
use crate::jobs::till_date_snapshot::DEFAULT_SNAPSHOT_HOUR_UTC;
use crate::services::chain_listener::ReconnectPolicy;
use crate::services::transfer_analytics::AnalyticsSettings;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const CHAIN_WS_URL: &str = "CHAIN_WS_URL";
pub const TOKEN_CONTRACT_ADDRESS: &str = "TOKEN_CONTRACT_ADDRESS";
pub const TOKEN_ABI: &str = "TOKEN_ABI";
pub const TOKEN_DECIMALS: &str = "TOKEN_DECIMALS";
pub const REDIS_HOST: &str = "REDIS_HOST";
pub const REDIS_PORT: &str = "REDIS_PORT";
pub const QUERY_CACHE_TTL_SECS: &str = "QUERY_CACHE_TTL_SECS";
pub const QUERY_TIMEOUT_SECS: &str = "QUERY_TIMEOUT_SECS";
pub const SUMMARY_INTERVAL_SECS: &str = "SUMMARY_INTERVAL_SECS";
pub const SNAPSHOT_HOUR_UTC: &str = "SNAPSHOT_HOUR_UTC";
pub const RECONNECT_INITIAL_DELAY_MS: &str = "RECONNECT_INITIAL_DELAY_MS";
pub const RECONNECT_MAX_DELAY_MS: &str = "RECONNECT_MAX_DELAY_MS";

const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub database_url: String,
    pub chain_ws_url: String,
    pub token_contract_address: String,
    /// JSON ABI; the built-in `Transfer` event is used when absent
    pub token_abi: Option<String>,
    pub token_decimals: u8,
    /// `None` selects the in-process cache
    pub redis: Option<RedisConfig>,
    pub query_cache_ttl: Duration,
    pub query_timeout: Duration,
    pub summary_interval: Duration,
    pub snapshot_hour_utc: u32,
    pub reconnect: ReconnectPolicy,
}

impl IndexerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let redis = match get(REDIS_HOST) {
            Some(host) => Some(RedisConfig {
                host,
                port: parse_or(get(REDIS_PORT), REDIS_PORT, DEFAULT_REDIS_PORT)?,
            }),
            None => None,
        };

        let snapshot_hour_utc: u32 = parse_or(
            get(SNAPSHOT_HOUR_UTC),
            SNAPSHOT_HOUR_UTC,
            DEFAULT_SNAPSHOT_HOUR_UTC,
        )?;
        if snapshot_hour_utc > 23 {
            return Err(ConfigError::Invalid {
                key: SNAPSHOT_HOUR_UTC,
                value: snapshot_hour_utc.to_string(),
                reason: "must be between 0 and 23".to_string(),
            });
        }

        let summary_interval_secs: u64 = parse_or(
            get(SUMMARY_INTERVAL_SECS),
            SUMMARY_INTERVAL_SECS,
            DEFAULT_SUMMARY_INTERVAL.as_secs(),
        )?;
        if summary_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: SUMMARY_INTERVAL_SECS,
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(parse_or(
                get(RECONNECT_INITIAL_DELAY_MS),
                RECONNECT_INITIAL_DELAY_MS,
                1_000,
            )?),
            max_delay: Duration::from_millis(parse_or(
                get(RECONNECT_MAX_DELAY_MS),
                RECONNECT_MAX_DELAY_MS,
                30_000,
            )?),
        };

        Ok(Self {
            database_url: required(DATABASE_URL)?,
            chain_ws_url: required(CHAIN_WS_URL)?,
            token_contract_address: required(TOKEN_CONTRACT_ADDRESS)?,
            token_abi: get(TOKEN_ABI),
            token_decimals: parse_or(get(TOKEN_DECIMALS), TOKEN_DECIMALS, 6)?,
            redis,
            query_cache_ttl: Duration::from_secs(parse_or(
                get(QUERY_CACHE_TTL_SECS),
                QUERY_CACHE_TTL_SECS,
                150,
            )?),
            query_timeout: Duration::from_secs(parse_or(
                get(QUERY_TIMEOUT_SECS),
                QUERY_TIMEOUT_SECS,
                10,
            )?),
            summary_interval: Duration::from_secs(summary_interval_secs),
            snapshot_hour_utc,
            reconnect,
        })
    }

    pub fn analytics_settings(&self) -> AnalyticsSettings {
        AnalyticsSettings {
            memo_ttl: self.query_cache_ttl,
            query_timeout: self.query_timeout,
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}
