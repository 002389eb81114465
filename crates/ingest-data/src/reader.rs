//! Rate-limited, retrying block reader.
//!
//! Every RPC call passes three gates in order: a concurrency permit
//! (`tokio::sync::Semaphore`), the provider's token bucket (`governor`), and a
//! per-call timeout. Transient failures retry the whole block, so a block is
//! either returned complete or not at all.

use alloy::primitives::B256;
use futures::{StreamExt, TryStreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryPolicy;
use crate::rpc::{ChainRpc, RpcError};
use crate::stats::{bump, IngestStats};
use crate::types::{BlockBundle, ChainHandle, Receipt, ReceiptMode};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transient failures outlasted the retry budget. The orchestrator may
    /// retry the range with a smaller batch.
    #[error("block {block}: gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        block: u64,
        attempts: u32,
        #[source]
        source: RpcError,
    },
    /// Retrying cannot help.
    #[error("fatal rpc error{}: {source}", block.map(|b| format!(" at block {b}")).unwrap_or_default())]
    Fatal {
        block: Option<u64>,
        #[source]
        source: RpcError,
    },
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RetriesExhausted { .. })
    }
}

/// Fetches blocks for one chain.
pub struct ChainReader {
    rpc: Arc<dyn ChainRpc>,
    handle: Arc<ChainHandle>,
    limiter: Arc<DefaultDirectRateLimiter>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    stats: Arc<IngestStats>,
}

impl ChainReader {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        handle: Arc<ChainHandle>,
        retry: RetryPolicy,
        stats: Arc<IngestStats>,
    ) -> Self {
        let rps = NonZeroU32::new(handle.rate_limit.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(handle.rate_limit.burst).unwrap_or(rps);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps).allow_burst(burst)));
        let permits = Arc::new(Semaphore::new(handle.concurrency.max(1)));

        tracing::debug!(
            chain = %handle.name,
            rps = rps.get(),
            burst = burst.get(),
            concurrency = handle.concurrency,
            "initialized chain reader"
        );

        Self {
            rpc,
            handle,
            limiter,
            permits,
            retry,
            stats,
        }
    }

    pub fn handle(&self) -> &ChainHandle {
        &self.handle
    }

    /// Runs one RPC call through the permit, the token bucket and the timeout.
    ///
    /// Waiting for a token counts against the timeout: a request that cannot
    /// be admitted in time fails as [`RpcError::Timeout`].
    async fn call<T, F, Fut>(&self, method: &'static str, f: F) -> Result<T, RpcError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let timeout = self.handle.request_timeout;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RpcError::Connection("request pool closed".to_string()))?;

        bump(&self.stats.rpc_calls, 1);
        let admitted_and_called = async {
            self.limiter.until_ready().await;
            tracing::trace!(chain = %self.handle.name, method, "rate limiter admitted call");
            f().await
        };

        match tokio::time::timeout(timeout, admitted_and_called).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(timeout)),
        }
    }

    /// Retries `op` on transient errors until the policy gives up.
    async fn with_retry<T, F, Fut>(&self, block: u64, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => {
                    return Err(FetchError::Fatal {
                        block: Some(block),
                        source: err,
                    })
                }
                Err(err) if self.retry.should_retry(attempt) => {
                    let backoff = self.retry.backoff(attempt);
                    bump(&self.stats.rpc_retries, 1);
                    tracing::warn!(
                        chain = %self.handle.name,
                        block_number = block,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying block fetch"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(FetchError::RetriesExhausted {
                        block,
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            }
        }
    }

    /// Checks the node serves the configured chain.
    ///
    /// # Errors
    /// [`RpcError::ChainIdMismatch`] (as [`FetchError::Fatal`]) on mismatch.
    #[tracing::instrument(skip(self), fields(chain = %self.handle.name))]
    pub async fn verify_chain_id(&self) -> Result<(), FetchError> {
        let actual = self
            .with_retry(0, || self.call("eth_chainId", || self.rpc.chain_id()))
            .await?;
        if actual != self.handle.chain_id {
            return Err(FetchError::Fatal {
                block: None,
                source: RpcError::ChainIdMismatch {
                    expected: self.handle.chain_id,
                    actual,
                },
            });
        }
        Ok(())
    }

    /// Latest block number reported by the node.
    pub async fn head(&self) -> Result<u64, FetchError> {
        self.with_retry(0, || self.call("eth_blockNumber", || self.rpc.head()))
            .await
    }

    /// One `eth_getTransactionReceipt` per hash, each through [`Self::call`]
    /// and at most `concurrency` at a time. Output keeps `hashes` order.
    async fn receipts_per_transaction(
        &self,
        number: u64,
        hashes: Vec<B256>,
    ) -> Result<Vec<Receipt>, RpcError> {
        let receipts: Vec<Option<Receipt>> = futures::stream::iter(hashes)
            .map(move |hash| {
                self.call("eth_getTransactionReceipt", move || self.rpc.receipt(number, hash))
            })
            .buffered(self.handle.concurrency.max(1))
            .try_collect()
            .await?;
        // A missing receipt means the node has not indexed the block fully.
        receipts
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(RpcError::NotAvailable(number))
    }

    /// Fetches one block with its transactions and receipts as a unit.
    async fn fetch_block_once(&self, number: u64) -> Result<BlockBundle, RpcError> {
        let (block, mut transactions) = self
            .call("eth_getBlockByNumber", || self.rpc.block(number))
            .await?
            .ok_or(RpcError::NotAvailable(number))?;

        let receipts = match self.handle.receipts {
            ReceiptMode::Block => {
                self.call("eth_getBlockReceipts", || self.rpc.block_receipts(number))
                    .await?
            }
            ReceiptMode::PerTransaction => {
                let hashes: Vec<B256> = transactions.iter().map(|tx| tx.hash).collect();
                self.receipts_per_transaction(number, hashes).await?
            }
        };

        if receipts.len() != transactions.len() {
            // Some providers return a short list while still indexing the block.
            return Err(RpcError::NotAvailable(number));
        }

        let mut logs = Vec::new();
        for (tx, receipt) in transactions.iter_mut().zip(receipts) {
            if tx.hash != receipt.tx_hash {
                return Err(RpcError::Malformed(format!(
                    "receipt order mismatch in block {number}: {} vs {}",
                    tx.hash, receipt.tx_hash
                )));
            }
            tx.status = receipt.status;
            tx.gas_used = Some(receipt.gas_used);
            tx.effective_gas_price = receipt.effective_gas_price;
            logs.extend(receipt.logs);
        }
        logs.sort_by_key(|log| log.log_index);

        Ok(BlockBundle {
            block,
            transactions,
            logs,
        })
    }

    /// Fetches one block, retrying transient failures in full.
    #[tracing::instrument(skip(self), fields(chain = %self.handle.name))]
    pub async fn fetch_block(&self, number: u64) -> Result<BlockBundle, FetchError> {
        self.with_retry(number, || self.fetch_block_once(number)).await
    }

    /// Fetches `[start, end]` in increasing block order.
    ///
    /// Up to `concurrency` blocks are in flight at once. The first error ends
    /// the fetch; no partial range is returned. Cancellation aborts promptly
    /// with [`FetchError::Cancelled`].
    ///
    /// # Errors
    /// [`FetchError::RetriesExhausted`] when a block keeps failing transiently,
    /// [`FetchError::Fatal`] for non-transient errors.
    #[tracing::instrument(skip(self, cancel), fields(chain = %self.handle.name))]
    pub async fn fetch_block_range(
        &self,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlockBundle>, FetchError> {
        if start > end {
            return Ok(Vec::new());
        }

        let fetch = futures::stream::iter(start..=end)
            .map(|number| self.fetch_block(number))
            .buffered(self.handle.concurrency.max(1))
            .try_collect::<Vec<_>>();

        let bundles = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = fetch => result?,
        };

        let txs: usize = bundles.iter().map(|b| b.transactions.len()).sum();
        let logs: usize = bundles.iter().map(|b| b.logs.len()).sum();
        bump(&self.stats.blocks, bundles.len() as u64);
        bump(&self.stats.transactions, txs as u64);
        bump(&self.stats.logs, logs as u64);

        tracing::debug!(start, end, blocks = bundles.len(), txs, logs, "fetched block range");
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{sample_bundle_with_txs, sample_handle, Script, ScriptedRpc};
    use crate::types::{RateLimit, TxStatus};
    use std::time::{Duration, Instant};

    fn reader(rpc: Arc<ScriptedRpc>, attempts: u32) -> ChainReader {
        ChainReader::new(
            rpc,
            Arc::new(sample_handle(1)),
            RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(IngestStats::new()),
        )
    }

    #[tokio::test]
    async fn range_is_returned_in_block_order() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=40));
        let reader = reader(rpc, 3);

        let bundles = reader
            .fetch_block_range(10, 30, &CancellationToken::new())
            .await
            .expect("range should fetch");

        let numbers: Vec<u64> = bundles.iter().map(|b| b.block.number).collect();
        assert_eq!(numbers, (10..=30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transient_failures_within_budget_succeed() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 200..=210));
        rpc.script(205, Script::FailTransient(2));
        let reader = reader(rpc.clone(), 3);

        let bundles = reader
            .fetch_block_range(200, 210, &CancellationToken::new())
            .await
            .expect("retries should absorb two failures");
        assert_eq!(bundles.len(), 11);
        assert_eq!(rpc.block_calls(205), 3);
        assert_eq!(reader.stats.snapshot().rpc_retries, 2);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 1..=3));
        rpc.script(2, Script::Hang(1));
        let mut handle = sample_handle(1);
        handle.request_timeout = Duration::from_millis(50);
        let reader = ChainReader::new(
            rpc,
            Arc::new(handle),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(IngestStats::new()),
        );

        let bundles = reader
            .fetch_block_range(1, 3, &CancellationToken::new())
            .await
            .expect("timeout should be retried");
        assert_eq!(bundles.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_retryable_failures() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 200..=210));
        rpc.script(205, Script::FailTransient(u32::MAX));
        let reader = reader(rpc, 3);

        let err = reader
            .fetch_block_range(200, 210, &CancellationToken::new())
            .await
            .expect_err("block 205 should exhaust retries");
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            FetchError::RetriesExhausted {
                block: 205,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=5));
        rpc.script(3, Script::FailFatal);
        let reader = reader(rpc.clone(), 5);

        let err = reader
            .fetch_block_range(0, 5, &CancellationToken::new())
            .await
            .expect_err("fatal error should surface");
        assert!(matches!(err, FetchError::Fatal { block: Some(3), .. }));
        assert_eq!(rpc.block_calls(3), 1);
    }

    #[tokio::test]
    async fn chain_id_mismatch_is_fatal() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(137, 0..=1));
        let reader = reader(rpc, 3);

        let err = reader
            .verify_chain_id()
            .await
            .expect_err("mismatch should fail");
        assert!(matches!(
            err,
            FetchError::Fatal {
                source: RpcError::ChainIdMismatch {
                    expected: 1,
                    actual: 137
                },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn receipts_failure_refetches_whole_block() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=2));
        rpc.script(1, Script::FailReceipts(1));
        let reader = reader(rpc.clone(), 3);

        let bundle = reader.fetch_block(1).await.expect("block should succeed");
        assert_eq!(rpc.block_calls(1), 2);
        assert!(bundle
            .transactions
            .iter()
            .all(|tx| tx.status != TxStatus::Pending));
    }

    #[tokio::test]
    async fn cancellation_aborts_fetch() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=5));
        rpc.script(2, Script::Hang(u32::MAX));
        let mut handle = sample_handle(1);
        handle.request_timeout = Duration::from_secs(60);
        let reader = ChainReader::new(
            rpc,
            Arc::new(handle),
            RetryPolicy::default(),
            Arc::new(IngestStats::new()),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = reader
            .fetch_block_range(0, 5, &cancel)
            .await
            .expect_err("fetch should be cancelled");
        assert!(matches!(err, FetchError::Cancelled));
    }

    fn reader_with(rpc: Arc<ScriptedRpc>, handle: ChainHandle) -> ChainReader {
        ChainReader::new(
            rpc,
            Arc::new(handle),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            Arc::new(IngestStats::new()),
        )
    }

    #[tokio::test]
    async fn range_never_exceeds_concurrency() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=19));
        rpc.set_latency(Duration::from_millis(10));
        let reader = reader(rpc.clone(), 3);

        reader
            .fetch_block_range(0, 19, &CancellationToken::new())
            .await
            .expect("range should fetch");

        let peak = rpc.max_in_flight();
        assert!(peak <= 4, "peak in-flight {peak} above concurrency 4");
        assert!(peak > 1, "blocks should overlap, peak was {peak}");
    }

    #[tokio::test]
    async fn per_transaction_receipts_pass_through_the_request_gates() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=0));
        for number in 1..=4 {
            rpc.insert_bundle(sample_bundle_with_txs(number, 8));
        }
        rpc.set_latency(Duration::from_millis(5));
        let mut handle = sample_handle(1);
        handle.concurrency = 3;
        handle.receipts = ReceiptMode::PerTransaction;
        let reader = reader_with(rpc.clone(), handle);

        let bundles = reader
            .fetch_block_range(1, 4, &CancellationToken::new())
            .await
            .expect("range should fetch");

        let peak = rpc.max_in_flight();
        assert!(peak <= 3, "peak in-flight {peak} above concurrency 3");
        // One block call plus one receipt call per transaction.
        assert_eq!(reader.stats.snapshot().rpc_calls, 4 * (1 + 8));
        for bundle in &bundles {
            let indexes: Vec<u64> = bundle.transactions.iter().map(|tx| tx.index).collect();
            assert_eq!(indexes, (0..8).collect::<Vec<_>>());
            assert!(bundle
                .transactions
                .iter()
                .all(|tx| tx.status == TxStatus::Success && tx.gas_used == Some(21_000)));
        }
    }

    #[tokio::test]
    async fn per_transaction_receipt_failure_refetches_whole_block() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 0..=0));
        rpc.insert_bundle(sample_bundle_with_txs(1, 4));
        rpc.script(1, Script::FailReceipts(1));
        let mut handle = sample_handle(1);
        handle.receipts = ReceiptMode::PerTransaction;
        let reader = reader_with(rpc.clone(), handle);

        let bundle = reader.fetch_block(1).await.expect("block should succeed");
        assert_eq!(rpc.block_calls(1), 2);
        assert_eq!(bundle.transactions.len(), 4);
        assert_eq!(reader.stats.snapshot().rpc_retries, 1);
    }

    #[tokio::test]
    async fn low_rate_limit_spaces_calls_without_failures() {
        let rpc = Arc::new(ScriptedRpc::with_blocks(1, 1..=5));
        let mut handle = sample_handle(1);
        handle.rate_limit = RateLimit {
            requests_per_second: 20,
            burst: 1,
        };
        let reader = reader_with(rpc, handle);

        let started = Instant::now();
        let bundles = reader
            .fetch_block_range(1, 5, &CancellationToken::new())
            .await
            .expect("throttled range should still fetch");
        let elapsed = started.elapsed();

        // Ten calls at 20/s with a burst of one: nine waits of 50ms.
        assert_eq!(bundles.len(), 5);
        let snapshot = reader.stats.snapshot();
        assert_eq!(snapshot.rpc_calls, 10);
        assert_eq!(snapshot.rpc_retries, 0);
        assert!(
            elapsed >= Duration::from_millis(400),
            "calls were not spaced: {elapsed:?}"
        );
    }
}
