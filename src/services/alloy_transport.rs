//! Alloy WebSocket transport for the chain listener
//!
//! Connects over `eth_subscribe`, probes liveness with `eth_chainId` and
//! streams the token contract's `Transfer` logs from the latest block.

use alloy::{
    json_abi::JsonAbi,
    primitives::Address,
    providers::{Provider, ProviderBuilder, RootProvider, WsConnect},
    pubsub::PubSubFrontend,
    rpc::types::{BlockNumberOrTag, Filter, Log},
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::services::chain_listener::{
    ChainConnection, ChainTransport, ListenerError, TransferEvent, TransferStream,
};

sol! {
    #[derive(Debug)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Validated token contract descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferContract {
    pub address: Address,
}

impl TransferContract {
    /// Validate the contract address and, when given, its JSON ABI.
    ///
    /// A supplied ABI must declare `Transfer(address,address,uint256)`.
    pub fn from_config(address: &str, abi: Option<&str>) -> Result<Self, ListenerError> {
        let address = Address::from_str(address.trim()).map_err(|e| {
            ListenerError::Config(format!("Invalid token contract address '{}': {}", address, e))
        })?;

        if let Some(raw) = abi {
            let abi: JsonAbi = serde_json::from_str(raw)
                .map_err(|e| ListenerError::Config(format!("Invalid token ABI: {}", e)))?;

            let declares_transfer = abi
                .events
                .get("Transfer")
                .map(|events| {
                    events
                        .iter()
                        .any(|event| event.selector() == Transfer::SIGNATURE_HASH)
                })
                .unwrap_or(false);

            if !declares_transfer {
                return Err(ListenerError::Config(
                    "Token ABI has no Transfer(address,address,uint256) event".to_string(),
                ));
            }
        }

        Ok(Self { address })
    }
}

pub struct AlloyWsTransport {
    ws_url: String,
    contract: TransferContract,
}

impl AlloyWsTransport {
    pub fn new(ws_url: &str, contract: TransferContract) -> Result<Self, ListenerError> {
        let ws_url = ws_url.trim();
        if ws_url.is_empty() {
            return Err(ListenerError::Config("Missing chain WebSocket URL".to_string()));
        }
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            return Err(ListenerError::Config(format!(
                "Chain endpoint must be a ws:// or wss:// URL, got '{}'",
                ws_url
            )));
        }

        Ok(Self {
            ws_url: ws_url.to_string(),
            contract,
        })
    }
}

pub struct AlloyWsConnection {
    provider: RootProvider<PubSubFrontend>,
    contract: Address,
}

#[async_trait]
impl ChainTransport for AlloyWsTransport {
    type Connection = AlloyWsConnection;

    async fn connect(&self) -> Result<AlloyWsConnection, ListenerError> {
        info!(contract = %self.contract.address, "Connecting to chain WebSocket endpoint");

        let provider = ProviderBuilder::new()
            .on_ws(WsConnect::new(self.ws_url.clone()))
            .await
            .map_err(|e| ListenerError::Connect(e.to_string()))?;

        Ok(AlloyWsConnection {
            provider,
            contract: self.contract.address,
        })
    }
}

#[async_trait]
impl ChainConnection for AlloyWsConnection {
    async fn is_listening(&self) -> Result<bool, ListenerError> {
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| ListenerError::Connect(format!("Liveness probe failed: {}", e)))?;

        debug!(chain_id = chain_id, "Chain endpoint is live");
        Ok(true)
    }

    async fn subscribe_transfers(&self) -> Result<TransferStream, ListenerError> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(BlockNumberOrTag::Latest);

        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| ListenerError::Subscribe(e.to_string()))?;

        Ok(subscription
            .into_stream()
            .map(|log| decode_transfer(&log))
            .boxed())
    }
}

/// Decode a raw `Transfer` log into a `TransferEvent`
pub fn decode_transfer(log: &Log) -> Result<TransferEvent, ListenerError> {
    let decoded = log
        .log_decode::<Transfer>()
        .map_err(|e| ListenerError::Decode(e.to_string()))?;

    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| ListenerError::Decode("log has no transaction hash".to_string()))?;
    let block_number = log
        .block_number
        .ok_or_else(|| ListenerError::Decode("log has no block number".to_string()))?;

    let Transfer { from, to, value } = decoded.inner.data;

    Ok(TransferEvent {
        transaction_hash: format!("{:?}", transaction_hash),
        from: address_key(&from),
        to: address_key(&to),
        value,
        block_number,
    })
}

/// Lower-cased 0x form used for storage and equality filters
fn address_key(address: &Address) -> String {
    address.to_string().to_lowercase()
}
