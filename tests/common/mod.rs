//! Shared test helpers and utilities.
//!
//! Factories for pipelines backed by a scripted node and a temporary SQLite
//! store, plus builders for the raw logs the classifier recognizes.

#![allow(dead_code)]

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use ingest_data::mock::{sample_handle, sample_log, ScriptedRpc};
use ingest_data::{LogEntry, RetryPolicy, Store};
use ingest_decode::signatures::{erc20::IERC20, uniswap_v2::IUniswapV2Pair};
use ingest_decode::SignatureRegistry;
use ingest_pipeline::{ChainPipeline, PipelineSettings};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Contract address used for every synthetic log.
pub const TOKEN: Address = Address::repeat_byte(0xaa);

/// A file-backed SQLite store in a fresh temporary directory.
///
/// The directory is removed when the returned `TempDir` is dropped, so keep
/// it alive for as long as the store is used.
pub fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = TempDir::new().expect("temp dir should be creatable");
    let path = dir.path().join("ingest.sqlite");
    let store = Store::new(path.to_str().expect("temp path should be utf-8"))
        .expect("store should open in temp dir");
    (dir, Arc::new(store))
}

/// Reopens the database behind a [`temp_store`], as a restarted process would.
pub fn reopen(dir: &TempDir) -> Arc<Store> {
    let path = dir.path().join("ingest.sqlite");
    Arc::new(
        Store::new(path.to_str().expect("temp path should be utf-8"))
            .expect("store should reopen"),
    )
}

/// Fast retry policy so failure tests finish quickly.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
}

pub fn settings(batch_width: u64) -> PipelineSettings {
    PipelineSettings {
        batch_width,
        max_shrink_retries: 4,
        start_block: None,
        end_block: None,
        poll_interval: Duration::from_millis(10),
        read_retry: fast_retry(3),
        write_retry: fast_retry(3),
        max_batch: 1_000,
    }
}

/// Pipeline that writes into and checkpoints against `store`.
pub fn sqlite_pipeline(
    chain_id: u64,
    rpc: Arc<ScriptedRpc>,
    store: Arc<Store>,
    settings: PipelineSettings,
) -> ChainPipeline {
    ChainPipeline::new(
        sample_handle(chain_id),
        rpc,
        store.clone(),
        store,
        Arc::new(SignatureRegistry::builtin()),
        settings,
    )
}

pub fn addr_topic(addr: Address) -> B256 {
    addr.into_word()
}

fn words(values: &[U256]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes::<32>()).collect()
}

/// ERC-20 `Transfer(from, to, amount)` emitted by [`TOKEN`].
pub fn erc20_transfer(block: u64, log_index: u64, amount: U256) -> LogEntry {
    sample_log(
        block,
        log_index,
        TOKEN,
        vec![
            IERC20::Transfer::SIGNATURE_HASH,
            addr_topic(Address::repeat_byte(0x0f)),
            addr_topic(Address::repeat_byte(0x0e)),
        ],
        words(&[amount]),
    )
}

/// Uniswap V2 swap of `amount_in` token1 for `amount_out` token0.
pub fn v2_swap(block: u64, log_index: u64, amount_in: u64, amount_out: u64) -> LogEntry {
    sample_log(
        block,
        log_index,
        TOKEN,
        vec![
            IUniswapV2Pair::Swap::SIGNATURE_HASH,
            addr_topic(Address::repeat_byte(0x02)),
            addr_topic(Address::repeat_byte(0x03)),
        ],
        words(&[
            U256::ZERO,
            U256::from(amount_in),
            U256::from(amount_out),
            U256::ZERO,
        ]),
    )
}

/// A log whose topic0 no registry entry knows.
pub fn unknown_event(block: u64, log_index: u64) -> LogEntry {
    sample_log(block, log_index, TOKEN, vec![B256::repeat_byte(0xde)], Vec::new())
}
