#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use sea_orm::DbErr;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use transfer_analytics::entities::transactions;
use transfer_analytics::services::chain_listener::{
    ChainConnection, ChainTransport, ListenerError, TransferEvent, TransferStream,
};
use transfer_analytics::services::result_cache::{CacheError, MokaResultCache, ResultCache};
use transfer_analytics::services::transaction_store::{
    GroupField, GroupedVolume, NewTransaction, StoreError, TransactionFilter, TransactionStore,
};
use transfer_analytics::services::transfer_analytics::{AnalyticsSettings, TransferAnalytics};

pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";
pub const CAROL: &str = "0x00000000000000000000000000000000000ca201";

/// In-memory `TransactionStore` that counts calls and can be told to fail
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<transactions::Model>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a record with an explicit ingestion time
    pub fn insert_at(&self, from: &str, to: &str, amount: Decimal, created_at: DateTime<Utc>) {
        let mut records = self.records.lock().unwrap();
        let id = records.len() as i64 + 1;
        records.push(transactions::Model {
            id,
            tx_hash: format!("0x{:064x}", id),
            from_address: from.to_string(),
            to_address: to.to_string(),
            amount,
            block_number: id,
            created_at: created_at.fixed_offset(),
        });
    }

    pub fn records(&self) -> Vec<transactions::Model> {
        self.records.lock().unwrap().clone()
    }

    /// Number of query or append calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(DbErr::Custom("store is down".to_string())));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn append(&self, record: NewTransaction) -> Result<i64, StoreError> {
        self.enter()?;
        let mut records = self.records.lock().unwrap();
        let id = records.len() as i64 + 1;
        records.push(transactions::Model {
            id,
            tx_hash: record.tx_hash,
            from_address: record.from_address,
            to_address: record.to_address,
            amount: record.amount,
            block_number: record.block_number,
            created_at: Utc::now().fixed_offset(),
        });
        Ok(id)
    }

    async fn sum_amount(&self, filter: &TransactionFilter) -> Result<Option<Decimal>, StoreError> {
        self.enter()?;
        let records = self.records.lock().unwrap();
        let matching: Vec<Decimal> = records
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| r.amount)
            .collect();

        if matching.is_empty() {
            Ok(None)
        } else {
            Ok(Some(matching.into_iter().sum()))
        }
    }

    async fn grouped_sum(
        &self,
        group: GroupField,
        filter: &TransactionFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<GroupedVolume>, StoreError> {
        self.enter()?;
        let records = self.records.lock().unwrap();
        let mut totals: HashMap<String, Decimal> = HashMap::new();

        for record in records.iter().filter(|r| filter.matches(r)) {
            let parties: Vec<&str> = match group {
                GroupField::Sender => vec![record.from_address.as_str()],
                GroupField::Recipient => vec![record.to_address.as_str()],
                GroupField::Account => {
                    vec![record.from_address.as_str(), record.to_address.as_str()]
                }
            };
            for party in parties {
                *totals.entry(party.to_string()).or_insert(Decimal::ZERO) += record.amount;
            }
        }

        let mut rows: Vec<GroupedVolume> = totals
            .into_iter()
            .map(|(address, volume)| GroupedVolume { address, volume })
            .collect();
        rows.sort_by(|a, b| b.volume.cmp(&a.volume).then_with(|| a.address.cmp(&b.address)));

        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}

fn cache_down() -> CacheError {
    CacheError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, "cache is down")))
}

/// Cache whose every call fails
pub struct FailingCache;

#[async_trait]
impl ResultCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(cache_down())
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<(), CacheError> {
        Err(cache_down())
    }
}

/// Cache that never hits and whose writes hang far past any test deadline
pub struct SlowCache;

#[async_trait]
impl ResultCache for SlowCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

/// Give background memo writes time to land
pub async fn settle_cache_writes() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub fn settings() -> AnalyticsSettings {
    AnalyticsSettings {
        memo_ttl: Duration::from_secs(150),
        query_timeout: Duration::from_secs(2),
    }
}

pub fn analytics_with(
    store: Arc<MemoryStore>,
    cache: Arc<dyn ResultCache>,
) -> TransferAnalytics {
    TransferAnalytics::new(store, cache, settings())
}

/// Engine over a fresh store and in-process cache
pub fn setup_analytics() -> (TransferAnalytics, Arc<MemoryStore>, Arc<MokaResultCache>) {
    let store = MemoryStore::new();
    let cache = Arc::new(MokaResultCache::new());
    let analytics = analytics_with(store.clone(), cache.clone());
    (analytics, store, cache)
}

/// What the next `connect()` call does
pub enum ConnectScript {
    /// Fail to connect
    Refuse,
    /// Connect but report the transport as not listening
    Deaf,
    /// Connect and hand out a stream fed by the paired sender
    Stream(mpsc::UnboundedReceiver<Result<TransferEvent, ListenerError>>),
}

/// Chain transport replaying a scripted sequence of connections
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<ConnectScript>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, step: ConnectScript) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Queue a live connection and return the sender feeding its stream
    pub fn push_stream(&self) -> mpsc::UnboundedSender<Result<TransferEvent, ListenerError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(ConnectScript::Stream(rx));
        tx
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnection {
    listening: bool,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<TransferEvent, ListenerError>>>>,
}

#[async_trait]
impl ChainTransport for ScriptedTransport {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection, ListenerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(ConnectScript::Stream(rx)) => Ok(ScriptedConnection {
                listening: true,
                events: Mutex::new(Some(rx)),
            }),
            Some(ConnectScript::Deaf) => Ok(ScriptedConnection {
                listening: false,
                events: Mutex::new(None),
            }),
            Some(ConnectScript::Refuse) | None => {
                Err(ListenerError::Connect("connection refused".to_string()))
            }
        }
    }
}

#[async_trait]
impl ChainConnection for ScriptedConnection {
    async fn is_listening(&self) -> Result<bool, ListenerError> {
        Ok(self.listening)
    }

    async fn subscribe_transfers(&self) -> Result<TransferStream, ListenerError> {
        let rx = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ListenerError::Subscribe("already subscribed".to_string()))?;
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

pub fn transfer(tx: u64, from: &str, to: &str, value: u64) -> TransferEvent {
    TransferEvent {
        transaction_hash: format!("0x{:064x}", tx),
        from: from.to_string(),
        to: to.to_string(),
        value: alloy::primitives::U256::from(value),
        block_number: tx,
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
