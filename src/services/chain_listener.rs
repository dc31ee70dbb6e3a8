//! Chain Event Listener
//!
//! Keeps one live subscription to a token contract's `Transfer` stream and
//! turns every decoded event into one Transaction Store write.
//!
//! State machine: `Disconnected -> Connecting -> Subscribed -> Disconnected`.
//! The first connection is startup-fatal; once subscribed, every drop is
//! followed by unbounded reconnection with capped exponential backoff.

use alloy::primitives::U256;
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::transaction_store::{NewTransaction, TransactionStore};

/// Integer digits that fit the `NUMERIC(26, 8)` amount column
const MAX_INTEGER_DIGITS: usize = 18;

/// Fractional digits kept per amount
const AMOUNT_SCALE: usize = 8;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listener configuration: {0}")]
    Config(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport is not listening")]
    NotListening,
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("transport dropped: {0}")]
    Transport(String),
    #[error("undecodable transfer log: {0}")]
    Decode(String),
    #[error("amount out of range: {0}")]
    Amount(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// A `Transfer` log decoded from the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub transaction_hash: String,
    pub from: String,
    pub to: String,
    /// Raw value in the token's smallest unit
    pub value: U256,
    pub block_number: u64,
}

/// Lazy sequence of decoded events; ends when the transport drops.
///
/// `Decode` items are skipped, any other error item is treated as a drop.
pub type TransferStream = BoxStream<'static, Result<TransferEvent, ListenerError>>;

#[async_trait]
pub trait ChainTransport: Send + Sync + 'static {
    type Connection: ChainConnection;

    async fn connect(&self) -> Result<Self::Connection, ListenerError>;
}

#[async_trait]
pub trait ChainConnection: Send + Sync + 'static {
    /// Liveness probe
    async fn is_listening(&self) -> Result<bool, ListenerError>;

    /// Subscribe to transfers from the chain's latest block forward
    async fn subscribe_transfers(&self) -> Result<TransferStream, ListenerError>;
}

/// Delay between reconnect attempts, doubling up to `max_delay`
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// A live connection and the event stream it feeds.
///
/// The connection is held so the stream's transport stays open.
struct Session<C> {
    _connection: C,
    events: TransferStream,
}

pub struct ChainListener<T: ChainTransport> {
    transport: T,
    store: Arc<dyn TransactionStore>,
    token_decimals: u8,
    reconnect: ReconnectPolicy,
    state: watch::Sender<ListenerState>,
}

/// Handle to a running listener task
pub struct ListenerHandle {
    task: JoinHandle<()>,
    state: watch::Receiver<ListenerState>,
}

impl ListenerHandle {
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the reconnect loop
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T: ChainTransport> ChainListener<T> {
    pub fn new(
        transport: T,
        store: Arc<dyn TransactionStore>,
        token_decimals: u8,
        reconnect: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            transport,
            store,
            token_decimals,
            reconnect,
            state,
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Establish the first subscription and spawn the event loop.
    ///
    /// Fails if the initial connection, probe or subscription fails.
    pub async fn start(self) -> Result<ListenerHandle, ListenerError> {
        let session = match self.establish().await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Initial chain subscription failed");
                return Err(e);
            }
        };

        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(session));

        Ok(ListenerHandle { task, state })
    }

    async fn run(self, mut session: Session<T::Connection>) {
        loop {
            let processed = self.drain(&mut session.events).await;
            self.state.send_replace(ListenerState::Disconnected);
            warn!(processed = processed, "Chain subscription dropped, reconnecting");

            session = self.reconnect().await;
        }
    }

    /// Connect, probe and subscribe once
    async fn establish(&self) -> Result<Session<T::Connection>, ListenerError> {
        self.state.send_replace(ListenerState::Connecting);

        let result = async {
            let connection = self.transport.connect().await?;
            if !connection.is_listening().await? {
                return Err(ListenerError::NotListening);
            }
            let events = connection.subscribe_transfers().await?;
            Ok(Session {
                _connection: connection,
                events,
            })
        }
        .await;

        match &result {
            Ok(_) => {
                self.state.send_replace(ListenerState::Subscribed);
                info!("Subscribed to token transfer events");
            }
            Err(_) => {
                self.state.send_replace(ListenerState::Disconnected);
            }
        }

        result
    }

    /// Retry `establish` until it succeeds
    async fn reconnect(&self) -> Session<T::Connection> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = self.reconnect.delay_for(attempt);
            tokio::time::sleep(delay).await;

            match self.establish().await {
                Ok(session) => {
                    info!(attempt = attempt, "Chain subscription re-established");
                    return session;
                }
                Err(e) => {
                    error!(
                        attempt = attempt,
                        error = %e,
                        next_delay_ms = self.reconnect.delay_for(attempt + 1).as_millis() as u64,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }

    /// Consume events in delivery order until the stream ends.
    ///
    /// Returns the number of events taken off the stream.
    async fn drain(&self, events: &mut TransferStream) -> u64 {
        let mut processed = 0u64;
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    processed += 1;
                    self.record(event).await;
                }
                Err(ListenerError::Decode(reason)) => {
                    warn!(reason = %reason, "Skipping undecodable transfer log");
                }
                Err(e) => {
                    warn!(error = %e, "Transfer stream failed");
                    break;
                }
            }
        }
        processed
    }

    /// Write one event; failures are logged and the event is dropped
    async fn record(&self, event: TransferEvent) {
        let record = match to_new_transaction(&event, self.token_decimals) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    tx_hash = %event.transaction_hash,
                    error = %e,
                    "Dropping transfer with unconvertible amount"
                );
                return;
            }
        };

        match self.store.append(record).await {
            Ok(id) => debug!(
                id = id,
                tx_hash = %event.transaction_hash,
                block = event.block_number,
                "Transfer recorded"
            ),
            Err(e) => error!(
                tx_hash = %event.transaction_hash,
                block = event.block_number,
                error = %e,
                "Failed to record transfer, event dropped"
            ),
        }
    }
}

pub fn to_new_transaction(
    event: &TransferEvent,
    token_decimals: u8,
) -> Result<NewTransaction, ListenerError> {
    let block_number = i64::try_from(event.block_number)
        .map_err(|_| ListenerError::Amount(format!("block {} too large", event.block_number)))?;

    Ok(NewTransaction {
        tx_hash: event.transaction_hash.clone(),
        from_address: event.from.clone(),
        to_address: event.to.clone(),
        amount: to_token_amount(event.value, token_decimals)?,
        block_number,
    })
}

/// Convert a smallest-unit value into token units.
///
/// Digits beyond the eighth fractional place are truncated.
pub fn to_token_amount(value: U256, decimals: u8) -> Result<Decimal, ListenerError> {
    let digits = value.to_string();
    let decimals = decimals as usize;

    let (integer, fraction) = if digits.len() > decimals {
        digits.split_at(digits.len() - decimals)
    } else {
        ("0", digits.as_str())
    };

    if integer.len() > MAX_INTEGER_DIGITS {
        return Err(ListenerError::Amount(format!(
            "{} has more than {} integer digits",
            value, MAX_INTEGER_DIGITS
        )));
    }

    let fraction = format!("{:0>width$}", fraction, width = decimals);
    let kept = &fraction[..fraction.len().min(AMOUNT_SCALE)];
    let text = if kept.is_empty() {
        integer.to_string()
    } else {
        format!("{}.{}", integer, kept)
    };

    Decimal::from_str(&text)
        .map(|amount| amount.normalize())
        .map_err(|e| ListenerError::Amount(format!("{}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_token_amount_six_decimals() {
        assert_eq!(to_token_amount(U256::from(12_500_000u64), 6).unwrap(), dec!(12.5));
        assert_eq!(to_token_amount(U256::from(1u64), 6).unwrap(), dec!(0.000001));
        assert_eq!(to_token_amount(U256::ZERO, 6).unwrap(), dec!(0));
    }

    #[test]
    fn test_to_token_amount_truncates_dust() {
        let value = U256::from(1_234_567_891_234_567_891u64);
        assert_eq!(to_token_amount(value, 18).unwrap(), dec!(1.23456789));
        assert_eq!(to_token_amount(U256::from(1u64), 18).unwrap(), dec!(0));
    }

    #[test]
    fn test_to_token_amount_zero_decimals() {
        assert_eq!(to_token_amount(U256::from(42u64), 0).unwrap(), dec!(42));
    }

    #[test]
    fn test_to_token_amount_rejects_oversized_values() {
        let value = U256::from(10u64).pow(U256::from(30u64));
        assert!(matches!(to_token_amount(value, 6), Err(ListenerError::Amount(_))));
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_new_transaction_carries_event_fields() {
        let event = TransferEvent {
            transaction_hash: "0xfeed".to_string(),
            from: "0x0000000000000000000000000000000000000001".to_string(),
            to: "0x0000000000000000000000000000000000000002".to_string(),
            value: U256::from(2_000_000u64),
            block_number: 77,
        };
        let record = to_new_transaction(&event, 6).unwrap();

        assert_eq!(record.tx_hash, "0xfeed");
        assert_eq!(record.amount, dec!(2));
        assert_eq!(record.block_number, 77);
    }
}
