//! Scripted in-memory [`ChainRpc`] for tests.
//!
//! Serves synthetic blocks and lets a test script per-block failures:
//! transient errors, fatal errors, hangs and receipt failures. Tracks the
//! high-water mark of concurrent calls.

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::rpc::{ChainRpc, RpcError};
use crate::types::{
    Block, BlockBundle, ChainHandle, LogEntry, RateLimit, Receipt, ReceiptMode, Transaction,
    TxStatus,
};

/// Failure behaviour for one block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// `eth_getBlockByNumber` fails transiently this many times
    FailTransient(u32),
    /// `eth_getBlockByNumber` returns a malformed-response error
    FailFatal,
    /// `eth_getBlockByNumber` hangs this many times
    Hang(u32),
    /// Receipts fail transiently this many times
    FailReceipts(u32),
}

/// Handle with generous limits suitable for tests.
pub fn sample_handle(chain_id: u64) -> ChainHandle {
    ChainHandle {
        chain_id,
        name: format!("chain-{chain_id}"),
        network: "testnet".to_string(),
        rpc_url: "http://127.0.0.1:8545".to_string(),
        confirmation_depth: 0,
        concurrency: 4,
        rate_limit: RateLimit {
            requests_per_second: 10_000,
            burst: 10_000,
        },
        request_timeout: Duration::from_secs(5),
        receipts: ReceiptMode::Block,
    }
}

/// Block `number` with one plain value transfer and no logs.
pub fn sample_bundle(number: u64) -> BlockBundle {
    sample_bundle_with_txs(number, 1)
}

/// Block `number` with `count` plain value transfers and no logs.
pub fn sample_bundle_with_txs(number: u64, count: u64) -> BlockBundle {
    let transactions: Vec<_> = (0..count).map(|index| sample_tx(number, index)).collect();
    BlockBundle {
        block: Block {
            number,
            hash: B256::from(U256::from(number)),
            parent_hash: B256::from(U256::from(number.saturating_sub(1))),
            timestamp: 1_700_000_000 + number * 12,
            gas_used: 21_000 * count,
            gas_limit: 30_000_000,
            transaction_count: count,
            miner: Address::repeat_byte(0x99),
            base_fee_per_gas: Some(U256::from(10_000_000_000u64)),
        },
        transactions,
        logs: Vec::new(),
    }
}

fn sample_tx(number: u64, index: u64) -> Transaction {
    Transaction {
        block_number: number,
        hash: tx_hash(number, index),
        index,
        from: Address::repeat_byte(0x11),
        to: Some(Address::repeat_byte(0x22)),
        value: U256::from(1_000_000_000_000_000_000u128),
        gas_limit: 21_000,
        gas_price: Some(U256::from(20_000_000_000u64)),
        gas_used: Some(21_000),
        effective_gas_price: Some(U256::from(20_000_000_000u64)),
        status: TxStatus::Success,
        input_size: 0,
    }
}

/// Deterministic transaction hash for `(block, index)`.
pub fn tx_hash(block: u64, index: u64) -> B256 {
    B256::from(U256::from(((block as u128) << 64) | index as u128))
}

/// A log emitted by the first transaction of `block`.
pub fn sample_log(block: u64, log_index: u64, address: Address, topics: Vec<B256>, data: Vec<u8>) -> LogEntry {
    LogEntry {
        block_number: block,
        tx_hash: tx_hash(block, 0),
        tx_index: 0,
        log_index,
        address,
        topics,
        data: Bytes::from(data),
    }
}

#[derive(Debug)]
pub struct ScriptedRpc {
    chain_id: u64,
    head: AtomicU64,
    bundles: Mutex<BTreeMap<u64, BlockBundle>>,
    scripts: Mutex<HashMap<u64, Script>>,
    block_calls: Mutex<HashMap<u64, u32>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a> {
    rpc: &'a ScriptedRpc,
}

impl<'a> InFlight<'a> {
    fn enter(rpc: &'a ScriptedRpc) -> Self {
        let now = rpc.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        rpc.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { rpc }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.rpc.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedRpc {
    /// Serves [`sample_bundle`] for every block in `range`; head is the range end.
    pub fn with_blocks(chain_id: u64, range: RangeInclusive<u64>) -> Self {
        let head = *range.end();
        let bundles = range.map(|n| (n, sample_bundle(n))).collect();
        Self {
            chain_id,
            head: AtomicU64::new(head),
            bundles: Mutex::new(bundles),
            scripts: Mutex::new(HashMap::new()),
            block_calls: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every head, block and receipt call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency lock should not be poisoned") = latency;
    }

    /// Most head, block and receipt calls ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Enters the in-flight count and waits out the configured latency.
    async fn enter(&self) -> InFlight<'_> {
        let guard = InFlight::enter(self);
        let latency = *self.latency.lock().expect("latency lock should not be poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn receipt_for(bundle: &BlockBundle, tx: &Transaction) -> Receipt {
        Receipt {
            tx_hash: tx.hash,
            status: tx.status,
            gas_used: tx.gas_used.unwrap_or(tx.gas_limit),
            effective_gas_price: tx.effective_gas_price,
            logs: bundle
                .logs
                .iter()
                .filter(|log| log.tx_hash == tx.hash)
                .cloned()
                .collect(),
        }
    }

    fn receipts_failure(&self, number: u64) -> Result<(), RpcError> {
        match self.take_script(number, true) {
            Some(Script::FailReceipts(_)) => Err(RpcError::RateLimited(format!(
                "scripted 429 for receipts of {number}"
            ))),
            _ => Ok(()),
        }
    }

    pub fn script(&self, block: u64, script: Script) {
        self.scripts
            .lock()
            .expect("scripts lock should not be poisoned")
            .insert(block, script);
    }

    pub fn clear_script(&self, block: u64) {
        self.scripts
            .lock()
            .expect("scripts lock should not be poisoned")
            .remove(&block);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Adds or replaces a block, raising head if needed.
    pub fn insert_bundle(&self, bundle: BlockBundle) {
        self.head.fetch_max(bundle.block.number, Ordering::SeqCst);
        self.bundles
            .lock()
            .expect("bundles lock should not be poisoned")
            .insert(bundle.block.number, bundle);
    }

    /// Appends a log to an existing block.
    pub fn push_log(&self, log: LogEntry) {
        let mut bundles = self.bundles.lock().expect("bundles lock should not be poisoned");
        if let Some(bundle) = bundles.get_mut(&log.block_number) {
            bundle.logs.push(log);
        }
    }

    /// How many times `eth_getBlockByNumber` was called for `block`.
    pub fn block_calls(&self, block: u64) -> u32 {
        self.block_calls
            .lock()
            .expect("calls lock should not be poisoned")
            .get(&block)
            .copied()
            .unwrap_or(0)
    }

    /// Consumes one scripted failure for `block`, if any applies.
    fn take_script(&self, block: u64, receipts: bool) -> Option<Script> {
        let mut scripts = self.scripts.lock().expect("scripts lock should not be poisoned");
        let script = scripts.get_mut(&block)?;
        match script {
            Script::FailFatal if !receipts => Some(Script::FailFatal),
            Script::FailTransient(n) if !receipts && *n > 0 => {
                *n -= 1;
                Some(Script::FailTransient(*n))
            }
            Script::Hang(n) if !receipts && *n > 0 => {
                *n -= 1;
                Some(Script::Hang(*n))
            }
            Script::FailReceipts(n) if receipts && *n > 0 => {
                *n -= 1;
                Some(Script::FailReceipts(*n))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ChainRpc for ScriptedRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.chain_id)
    }

    async fn head(&self) -> Result<u64, RpcError> {
        let _in_flight = self.enter().await;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block(&self, number: u64) -> Result<Option<(Block, Vec<Transaction>)>, RpcError> {
        let _in_flight = self.enter().await;
        *self
            .block_calls
            .lock()
            .expect("calls lock should not be poisoned")
            .entry(number)
            .or_insert(0) += 1;

        match self.take_script(number, false) {
            Some(Script::FailTransient(_)) => {
                return Err(RpcError::Server(format!("scripted 503 for block {number}")))
            }
            Some(Script::FailFatal) => {
                return Err(RpcError::Malformed(format!("scripted garbage for block {number}")))
            }
            Some(Script::Hang(_)) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Err(RpcError::Connection("scripted hang ended".to_string()));
            }
            _ => {}
        }

        let bundles = self.bundles.lock().expect("bundles lock should not be poisoned");
        Ok(bundles.get(&number).map(|bundle| {
            let txs = bundle
                .transactions
                .iter()
                .cloned()
                .map(|mut tx| {
                    tx.status = TxStatus::Pending;
                    tx.gas_used = None;
                    tx.effective_gas_price = None;
                    tx
                })
                .collect();
            (bundle.block.clone(), txs)
        }))
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, RpcError> {
        let _in_flight = self.enter().await;
        self.receipts_failure(number)?;

        let bundles = self.bundles.lock().expect("bundles lock should not be poisoned");
        let bundle = bundles.get(&number).ok_or(RpcError::NotAvailable(number))?;
        Ok(bundle
            .transactions
            .iter()
            .map(|tx| Self::receipt_for(bundle, tx))
            .collect())
    }

    async fn receipt(&self, number: u64, hash: B256) -> Result<Option<Receipt>, RpcError> {
        let _in_flight = self.enter().await;
        self.receipts_failure(number)?;

        let bundles = self.bundles.lock().expect("bundles lock should not be poisoned");
        Ok(bundles.get(&number).and_then(|bundle| {
            bundle
                .transactions
                .iter()
                .find(|tx| tx.hash == hash)
                .map(|tx| Self::receipt_for(bundle, tx))
        }))
    }
}
