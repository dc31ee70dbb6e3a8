//! SeaORM Entity for indexed token transfers

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Chain transaction hash (not unique)
    pub tx_hash: String,
    /// Lower-cased 0x address
    pub from_address: String,
    /// Lower-cased 0x address
    pub to_address: String,
    /// Transferred quantity in human-readable token units
    #[sea_orm(column_type = "Decimal(Some((26, 8)))")]
    pub amount: Decimal,
    pub block_number: i64,
    /// Ingestion time, the time axis of every range query
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
