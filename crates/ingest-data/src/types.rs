//! Chain-level data model shared by the reader, classifier and sinks.
//!
//! Hashes, addresses and quantities use alloy primitives so that values
//! arriving from the node keep their full width until a sink encodes them.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token-bucket parameters for one RPC provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Requests admitted back-to-back before throttling kicks in
    pub burst: u32,
}

/// How transaction receipts are requested for a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptMode {
    /// One `eth_getBlockReceipts` call per block
    #[default]
    Block,
    /// One `eth_getTransactionReceipt` call per transaction
    PerTransaction,
}

/// Identifies one chain and the limits used when talking to its provider.
///
/// Built once from configuration and shared behind an `Arc` for the
/// lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHandle {
    pub chain_id: u64,
    pub name: String,
    /// Free-form network label ("mainnet", "sepolia", ...) written as a tag
    pub network: String,
    pub rpc_url: String,
    /// Blocks withheld behind head before a block counts as final
    pub confirmation_depth: u64,
    /// Maximum simultaneous in-flight RPC requests
    pub concurrency: usize,
    pub rate_limit: RateLimit,
    /// Upper bound for a single RPC call, including the rate-limit wait
    pub request_timeout: Duration,
    pub receipts: ReceiptMode,
}

impl ChainHandle {
    /// Highest block considered final for the given head.
    pub fn confirmed_head(&self, head: u64) -> Option<u64> {
        head.checked_sub(self.confirmation_depth)
    }
}

/// Block header fields kept for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix seconds
    pub timestamp: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub transaction_count: u64,
    /// Fee recipient (miner or validator)
    pub miner: Address,
    pub base_fee_per_gas: Option<U256>,
}

/// Execution status from the receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
    /// No receipt yet. Never persisted.
    Pending,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
            TxStatus::Pending => "pending",
        }
    }
}

/// A transaction within a block, merged with its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub block_number: u64,
    pub hash: B256,
    /// Position in the block
    pub index: u64,
    pub from: Address,
    /// Absent for contract creation
    pub to: Option<Address>,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: Option<U256>,
    pub gas_used: Option<u64>,
    pub effective_gas_price: Option<U256>,
    pub status: TxStatus,
    /// Calldata length in bytes
    pub input_size: usize,
}

impl Transaction {
    /// Fee paid in wei, when the receipt carried enough to compute it.
    pub fn fee(&self) -> Option<U256> {
        let price = self.effective_gas_price.or(self.gas_price)?;
        let used = self.gas_used?;
        price.checked_mul(U256::from(used))
    }
}

/// A raw log emitted by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
    /// Emitting contract
    pub address: Address,
    /// Zero to four topics; topic0 is the event signature hash
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl LogEntry {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Receipt fields merged into [`Transaction`] by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: B256,
    pub status: TxStatus,
    pub gas_used: u64,
    pub effective_gas_price: Option<U256>,
    pub logs: Vec<LogEntry>,
}

/// One fully fetched block: header, transactions in index order and logs in
/// log-index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBundle {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub logs: Vec<LogEntry>,
}

impl BlockBundle {
    /// Sender of the transaction that emitted `log`, if present in this bundle.
    pub fn sender_of(&self, log: &LogEntry) -> Option<Address> {
        self.transactions
            .get(log.tx_index as usize)
            .filter(|tx| tx.hash == log.tx_hash)
            .or_else(|| self.transactions.iter().find(|tx| tx.hash == log.tx_hash))
            .map(|tx| tx.from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmed_head_saturates_near_genesis() {
        let handle = ChainHandle {
            chain_id: 1,
            name: "ethereum".to_string(),
            network: "mainnet".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            confirmation_depth: 12,
            concurrency: 4,
            rate_limit: RateLimit {
                requests_per_second: 10,
                burst: 10,
            },
            request_timeout: Duration::from_secs(5),
            receipts: ReceiptMode::Block,
        };

        assert_eq!(handle.confirmed_head(100), Some(88));
        assert_eq!(handle.confirmed_head(12), Some(0));
        assert_eq!(handle.confirmed_head(5), None);
    }

    #[test]
    fn fee_prefers_effective_price() {
        let tx = Transaction {
            block_number: 1,
            hash: B256::repeat_byte(1),
            index: 0,
            from: Address::repeat_byte(2),
            to: None,
            value: U256::ZERO,
            gas_limit: 21_000,
            gas_price: Some(U256::from(50u64)),
            gas_used: Some(21_000),
            effective_gas_price: Some(U256::from(30u64)),
            status: TxStatus::Success,
            input_size: 0,
        };

        assert_eq!(tx.fee(), Some(U256::from(630_000u64)));
    }
}
