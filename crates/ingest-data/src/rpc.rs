//! JSON-RPC access to a chain node.
//!
//! [`ChainRpc`] is the seam between the reader and the network; [`AlloyRpc`]
//! implements it over an alloy HTTP provider. Raw JSON shapes are decoded into
//! local serde structs and mapped onto the crate's types here, so nothing
//! downstream sees provider-specific structures.

use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::eth::BlockNumberOrTag;
use alloy::transports::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::types::{Block, LogEntry, Receipt, Transaction, TxStatus};

/// JSON-RPC error codes that providers use for throttling.
const THROTTLE_CODES: &[i64] = &[-32005, -32029, 429];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection error: {0}")]
    Connection(String),
    /// The node does not have the block yet (lagging behind its own head).
    #[error("block {0} not available")]
    NotAvailable(u64),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("chain id mismatch: configured {expected}, node reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    /// A well-formed JSON-RPC error that retrying will not fix.
    #[error("rpc error {code}: {message}")]
    Rejected { code: i64, message: String },
}

impl RpcError {
    /// Transient errors are retried by the reader; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout(_)
                | RpcError::RateLimited(_)
                | RpcError::Server(_)
                | RpcError::Connection(_)
                | RpcError::NotAvailable(_)
        )
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ErrorResp(resp) => {
                let message = resp.message.to_string();
                if THROTTLE_CODES.contains(&resp.code)
                    || message.contains("limit exceeded")
                    || message.contains("rate limit")
                {
                    RpcError::RateLimited(message)
                } else if (-32099..=-32000).contains(&resp.code) && message.contains("timeout") {
                    RpcError::Server(message)
                } else {
                    RpcError::Rejected {
                        code: resp.code,
                        message,
                    }
                }
            }
            TransportError::Transport(kind) => classify_transport(kind),
            TransportError::DeserError { err, text } => {
                let preview: String = text.chars().take(120).collect();
                RpcError::Malformed(format!("{err}: {preview}"))
            }
            TransportError::NullResp => RpcError::Malformed("null response".to_string()),
            other => RpcError::Malformed(other.to_string()),
        }
    }
}

fn classify_transport(kind: TransportErrorKind) -> RpcError {
    if let TransportErrorKind::HttpError(http) = &kind {
        return match http.status {
            429 => RpcError::RateLimited(http.body.clone()),
            500..=599 => RpcError::Server(format!("HTTP {}: {}", http.status, http.body)),
            status => RpcError::Rejected {
                code: i64::from(status),
                message: http.body.clone(),
            },
        };
    }
    // Connection resets, DNS failures and dropped backends.
    RpcError::Connection(kind.to_string())
}

/// The node calls the reader needs.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn head(&self) -> Result<u64, RpcError>;

    /// Block header plus full transactions, `None` if the node does not know it.
    async fn block(&self, number: u64) -> Result<Option<(Block, Vec<Transaction>)>, RpcError>;

    /// Receipts for every transaction of `number` in one call (`eth_getBlockReceipts`).
    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, RpcError>;

    /// Receipt of a single transaction of `number`, `None` if not yet indexed.
    async fn receipt(&self, number: u64, hash: B256) -> Result<Option<Receipt>, RpcError>;
}

/// [`ChainRpc`] over an alloy HTTP provider.
pub struct AlloyRpc {
    provider: DynProvider,
}

impl AlloyRpc {
    /// Builds the provider for `rpc_url`. Does not touch the network.
    ///
    /// # Errors
    /// Returns [`RpcError::Connection`] if the URL does not parse.
    pub fn new(rpc_url: &str) -> Result<Self, RpcError> {
        let url = rpc_url
            .parse()
            .map_err(|e| RpcError::Connection(format!("invalid RPC URL {rpc_url}: {e}")))?;
        let provider = ProviderBuilder::new().on_http(url).erased();
        Ok(Self { provider })
    }
}

#[async_trait]
impl ChainRpc for AlloyRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn head(&self) -> Result<u64, RpcError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block(&self, number: u64) -> Result<Option<(Block, Vec<Transaction>)>, RpcError> {
        let raw: Option<RawBlock> = self
            .provider
            .raw_request(
                "eth_getBlockByNumber".into(),
                (BlockNumberOrTag::Number(number), true),
            )
            .await?;
        raw.map(|block| block.into_parts(number)).transpose()
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, RpcError> {
        let raw: Option<Vec<RawReceipt>> = self
            .provider
            .raw_request(
                "eth_getBlockReceipts".into(),
                (BlockNumberOrTag::Number(number),),
            )
            .await?;
        raw.ok_or(RpcError::NotAvailable(number))?
            .into_iter()
            .map(|r| r.into_receipt(number))
            .collect()
    }

    async fn receipt(&self, number: u64, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let raw: Option<RawReceipt> = self
            .provider
            .raw_request("eth_getTransactionReceipt".into(), (hash,))
            .await?;
        raw.map(|r| r.into_receipt(number)).transpose()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: U64,
    hash: B256,
    parent_hash: B256,
    timestamp: U64,
    gas_used: U64,
    gas_limit: U64,
    miner: Address,
    #[serde(default)]
    base_fee_per_gas: Option<U256>,
    transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: B256,
    #[serde(default)]
    transaction_index: Option<U64>,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
    input: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    #[serde(default)]
    transaction_index: Option<U64>,
    /// Absent on pre-Byzantium receipts
    #[serde(default)]
    status: Option<U64>,
    gas_used: U64,
    #[serde(default)]
    effective_gas_price: Option<U256>,
    logs: Vec<RawLog>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    #[serde(default)]
    log_index: Option<U64>,
    #[serde(default)]
    removed: bool,
}

impl RawBlock {
    fn into_parts(self, requested: u64) -> Result<(Block, Vec<Transaction>), RpcError> {
        let number = self.number.to::<u64>();
        if number != requested {
            return Err(RpcError::Malformed(format!(
                "asked for block {requested}, got {number}"
            )));
        }

        let block = Block {
            number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp.to::<u64>(),
            gas_used: self.gas_used.to::<u64>(),
            gas_limit: self.gas_limit.to::<u64>(),
            transaction_count: self.transactions.len() as u64,
            miner: self.miner,
            base_fee_per_gas: self.base_fee_per_gas,
        };

        let transactions = self
            .transactions
            .into_iter()
            .enumerate()
            .map(|(idx, tx)| Transaction {
                block_number: number,
                hash: tx.hash,
                index: tx
                    .transaction_index
                    .map(|i| i.to::<u64>())
                    .unwrap_or(idx as u64),
                from: tx.from,
                to: tx.to,
                value: tx.value,
                gas_limit: tx.gas.to::<u64>(),
                gas_price: tx.gas_price,
                gas_used: None,
                effective_gas_price: None,
                status: TxStatus::Pending,
                input_size: tx.input.len(),
            })
            .collect();

        Ok((block, transactions))
    }
}

impl RawReceipt {
    fn into_receipt(self, block_number: u64) -> Result<Receipt, RpcError> {
        let tx_index = self.transaction_index.map(|i| i.to::<u64>()).unwrap_or(0);
        let status = match self.status.map(|s| s.to::<u64>()) {
            Some(1) | None => TxStatus::Success,
            Some(0) => TxStatus::Failed,
            Some(other) => {
                return Err(RpcError::Malformed(format!(
                    "receipt {} has status {other}",
                    self.transaction_hash
                )))
            }
        };

        let mut logs = Vec::with_capacity(self.logs.len());
        for log in self.logs.into_iter().filter(|l| !l.removed) {
            let log_index = log.log_index.ok_or_else(|| {
                RpcError::Malformed(format!("log without index in {}", self.transaction_hash))
            })?;
            if log.topics.len() > 4 {
                return Err(RpcError::Malformed(format!(
                    "log {} has {} topics",
                    log_index,
                    log.topics.len()
                )));
            }
            logs.push(LogEntry {
                block_number,
                tx_hash: self.transaction_hash,
                tx_index,
                log_index: log_index.to::<u64>(),
                address: log.address,
                topics: log.topics,
                data: log.data,
            });
        }

        Ok(Receipt {
            tx_hash: self.transaction_hash,
            status,
            gas_used: self.gas_used.to::<u64>(),
            effective_gas_price: self.effective_gas_price,
            logs,
        })
    }
}
