//! Per-run ingestion counters.
//!
//! One [`IngestStats`] is created per chain run and handed to the reader,
//! classifier and writer as an `Arc`. Increments are relaxed atomics; a
//! [`StatsSnapshot`] is taken for reporting.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Domain event kinds counted by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCounter {
    TokenTransfer,
    DexSwap,
    LiquidityChange,
    Lending,
    Staking,
    Yield,
    Unrecognized,
}

#[derive(Debug)]
pub struct IngestStats {
    started: Instant,
    pub blocks: AtomicU64,
    pub transactions: AtomicU64,
    pub logs: AtomicU64,
    pub token_transfers: AtomicU64,
    pub dex_swaps: AtomicU64,
    pub liquidity_changes: AtomicU64,
    pub lending_events: AtomicU64,
    pub staking_events: AtomicU64,
    pub yield_events: AtomicU64,
    pub unrecognized_dropped: AtomicU64,
    pub records_written: AtomicU64,
    pub records_failed: AtomicU64,
    pub rpc_calls: AtomicU64,
    pub rpc_retries: AtomicU64,
    pub write_retries: AtomicU64,
    pub batches_committed: AtomicU64,
    pub batch_shrinks: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            blocks: AtomicU64::new(0),
            transactions: AtomicU64::new(0),
            logs: AtomicU64::new(0),
            token_transfers: AtomicU64::new(0),
            dex_swaps: AtomicU64::new(0),
            liquidity_changes: AtomicU64::new(0),
            lending_events: AtomicU64::new(0),
            staking_events: AtomicU64::new(0),
            yield_events: AtomicU64::new(0),
            unrecognized_dropped: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_retries: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            batch_shrinks: AtomicU64::new(0),
        }
    }
}

/// Adds `n` to a counter.
pub fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, kind: EventCounter) {
        let counter = match kind {
            EventCounter::TokenTransfer => &self.token_transfers,
            EventCounter::DexSwap => &self.dex_swaps,
            EventCounter::LiquidityChange => &self.liquidity_changes,
            EventCounter::Lending => &self.lending_events,
            EventCounter::Staking => &self.staking_events,
            EventCounter::Yield => &self.yield_events,
            EventCounter::Unrecognized => &self.unrecognized_dropped,
        };
        bump(counter, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();
        let blocks = load(&self.blocks);
        StatsSnapshot {
            blocks,
            transactions: load(&self.transactions),
            logs: load(&self.logs),
            token_transfers: load(&self.token_transfers),
            dex_swaps: load(&self.dex_swaps),
            liquidity_changes: load(&self.liquidity_changes),
            lending_events: load(&self.lending_events),
            staking_events: load(&self.staking_events),
            yield_events: load(&self.yield_events),
            unrecognized_dropped: load(&self.unrecognized_dropped),
            records_written: load(&self.records_written),
            records_failed: load(&self.records_failed),
            rpc_calls: load(&self.rpc_calls),
            rpc_retries: load(&self.rpc_retries),
            write_retries: load(&self.write_retries),
            batches_committed: load(&self.batches_committed),
            batch_shrinks: load(&self.batch_shrinks),
            elapsed_secs: elapsed,
            blocks_per_second: if elapsed > 0.0 {
                blocks as f64 / elapsed
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub blocks: u64,
    pub transactions: u64,
    pub logs: u64,
    pub token_transfers: u64,
    pub dex_swaps: u64,
    pub liquidity_changes: u64,
    pub lending_events: u64,
    pub staking_events: u64,
    pub yield_events: u64,
    pub unrecognized_dropped: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub rpc_calls: u64,
    pub rpc_retries: u64,
    pub write_retries: u64,
    pub batches_committed: u64,
    pub batch_shrinks: u64,
    pub elapsed_secs: f64,
    pub blocks_per_second: f64,
}

impl StatsSnapshot {
    /// Events classified into a known kind.
    pub fn recognized_events(&self) -> u64 {
        self.token_transfers
            + self.dex_swaps
            + self.liquidity_changes
            + self.lending_events
            + self.staking_events
            + self.yield_events
    }
}
