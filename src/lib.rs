// src/lib.rs

use std::sync::Arc;

use services::transfer_analytics::TransferAnalytics;

/// Shared handle for an API layer to serve queries from
#[derive(Clone)]
pub struct AppState {
    pub analytics: Arc<TransferAnalytics>,
}

pub mod entities {
    pub mod prelude;
    pub mod transactions;
}

pub mod models {
    pub mod transaction;
}

pub mod services {
    pub mod alloy_transport;
    pub mod chain_listener;
    pub mod result_cache;
    pub mod transaction_store;
    pub mod transfer_analytics;
}

pub mod jobs;
pub mod config;
