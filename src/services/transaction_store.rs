//! Transaction Store
//!
//! Append-only record of indexed transfers behind a narrow contract:
//! append one record, sum amounts under a filter, and rank grouped sums.
//! `SeaOrmTransactionStore` is the Postgres implementation.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, Set, Statement,
    Value,
};
use thiserror::Error;
use tracing::debug;

use crate::entities::transactions;
use crate::models::transaction::{Role, TimeWindow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

/// A decoded transfer ready to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub tx_hash: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    pub block_number: i64,
}

/// Address restriction of a filter, one variant per query branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyFilter {
    Any,
    Sender(String),
    Recipient(String),
    Either(String),
}

/// Immutable filter over the transactions table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilter {
    pub window: TimeWindow,
    pub party: PartyFilter,
}

impl TransactionFilter {
    pub fn unrestricted(window: TimeWindow) -> Self {
        Self {
            window,
            party: PartyFilter::Any,
        }
    }

    /// Select the address branch for a volume query.
    ///
    /// Without a role (or with `total`) the address may appear on either side.
    pub fn for_address(window: TimeWindow, address: Option<String>, role: Option<Role>) -> Self {
        let party = match (address, role) {
            (None, _) => PartyFilter::Any,
            (Some(address), Some(Role::Sender)) => PartyFilter::Sender(address),
            (Some(address), Some(Role::Recipient)) => PartyFilter::Recipient(address),
            (Some(address), _) => PartyFilter::Either(address),
        };
        Self { window, party }
    }

    /// Whether a stored record satisfies this filter
    pub fn matches(&self, record: &transactions::Model) -> bool {
        if !self.window.contains(record.created_at.with_timezone(&Utc)) {
            return false;
        }
        match &self.party {
            PartyFilter::Any => true,
            PartyFilter::Sender(address) => record.from_address == *address,
            PartyFilter::Recipient(address) => record.to_address == *address,
            PartyFilter::Either(address) => {
                record.from_address == *address || record.to_address == *address
            }
        }
    }
}

/// Identity a leaderboard is grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField {
    Sender,
    Recipient,
    /// Each transfer counts once for its sender and once for its recipient
    Account,
}

impl From<Role> for GroupField {
    fn from(role: Role) -> Self {
        match role {
            Role::Sender => GroupField::Sender,
            Role::Recipient => GroupField::Recipient,
            Role::Total => GroupField::Account,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct GroupedVolume {
    pub address: String,
    pub volume: Decimal,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist one record and return its assigned id
    async fn append(&self, record: NewTransaction) -> Result<i64, StoreError>;

    /// `SUM(amount)` over matching records, `None` when nothing matched
    async fn sum_amount(&self, filter: &TransactionFilter) -> Result<Option<Decimal>, StoreError>;

    /// `SUM(amount)` per group ordered by volume descending then address
    async fn grouped_sum(
        &self,
        group: GroupField,
        filter: &TransactionFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<GroupedVolume>, StoreError>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct SeaOrmTransactionStore {
    db: DatabaseConnection,
}

impl SeaOrmTransactionStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[derive(Debug, FromQueryResult)]
struct VolumeRow {
    volume: Option<Decimal>,
}

#[async_trait]
impl TransactionStore for SeaOrmTransactionStore {
    async fn append(&self, record: NewTransaction) -> Result<i64, StoreError> {
        let model = transactions::ActiveModel {
            tx_hash: Set(record.tx_hash),
            from_address: Set(record.from_address),
            to_address: Set(record.to_address),
            amount: Set(record.amount),
            block_number: Set(record.block_number),
            created_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        let inserted = model.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn sum_amount(&self, filter: &TransactionFilter) -> Result<Option<Decimal>, StoreError> {
        let (clause, values) = where_clause(filter, "t.");
        let sql = format!("SELECT SUM(t.amount) AS volume FROM transactions t WHERE {clause}");
        debug!(sql = %sql, "Summing transfer volume");

        let row = VolumeRow::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            values,
        ))
        .one(&self.db)
        .await?;

        Ok(row.and_then(|r| r.volume))
    }

    async fn grouped_sum(
        &self,
        group: GroupField,
        filter: &TransactionFilter,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<GroupedVolume>, StoreError> {
        let (sql, values) = grouped_sum_statement(group, filter, limit, offset);
        debug!(sql = %sql, "Ranking grouped transfer volume");

        let rows = GroupedVolume::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            sql,
            values,
        ))
        .all(&self.db)
        .await?;

        Ok(rows)
    }
}

/// Build the `WHERE` body and its positional values.
///
/// `$1`/`$2` are always the window bounds, `$3` the address when present.
fn where_clause(filter: &TransactionFilter, alias: &str) -> (String, Vec<Value>) {
    let mut values: Vec<Value> = vec![filter.window.start.into(), filter.window.end.into()];
    let mut clause = format!("{alias}created_at BETWEEN $1 AND $2");

    match &filter.party {
        PartyFilter::Any => {}
        PartyFilter::Sender(address) => {
            values.push(address.clone().into());
            clause.push_str(&format!(" AND {alias}from_address = $3"));
        }
        PartyFilter::Recipient(address) => {
            values.push(address.clone().into());
            clause.push_str(&format!(" AND {alias}to_address = $3"));
        }
        PartyFilter::Either(address) => {
            values.push(address.clone().into());
            clause.push_str(&format!(
                " AND ({alias}from_address = $3 OR {alias}to_address = $3)"
            ));
        }
    }

    (clause, values)
}

fn grouped_sum_statement(
    group: GroupField,
    filter: &TransactionFilter,
    limit: u64,
    offset: u64,
) -> (String, Vec<Value>) {
    let (clause, mut values) = where_clause(filter, "t.");
    let limit_param = values.len() + 1;
    let offset_param = values.len() + 2;
    values.push((limit as i64).into());
    values.push((offset as i64).into());

    let sql = match group {
        GroupField::Sender | GroupField::Recipient => {
            let column = if group == GroupField::Sender {
                "t.from_address"
            } else {
                "t.to_address"
            };
            format!(
                "SELECT {column} AS address, SUM(t.amount) AS volume \
                 FROM transactions t \
                 WHERE {clause} \
                 GROUP BY {column} \
                 ORDER BY volume DESC, address ASC \
                 LIMIT ${limit_param} OFFSET ${offset_param}"
            )
        }
        GroupField::Account => format!(
            "SELECT legs.address AS address, SUM(legs.amount) AS volume \
             FROM transactions t \
             CROSS JOIN LATERAL (VALUES (t.from_address, t.amount), (t.to_address, t.amount)) \
                 AS legs(address, amount) \
             WHERE {clause} AND legs.address IS NOT NULL \
             GROUP BY legs.address \
             ORDER BY volume DESC, address ASC \
             LIMIT ${limit_param} OFFSET ${offset_param}"
        ),
    };

    (sql, values)
}
